//! Per-client sliding-window rate limiting for the ingest surface.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 1_000,
        }
    }
}

/// Verdict plus the header fields surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until the oldest counted request leaves the window.
    pub reset_secs: u64,
}

/// Sliding-window limiter: one timestamp deque per client id.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request for `client` and decide. Denials do not count.
    pub fn check(&self, client: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut clients = self.lock();
        let hits = clients.entry(client.to_string()).or_default();
        while hits.front().is_some_and(|&t| now - t >= self.config.window) {
            hits.pop_front();
        }

        let reset_secs = hits
            .front()
            .map(|&oldest| {
                self.config
                    .window
                    .saturating_sub(now - oldest)
                    .as_secs()
                    .max(1)
            })
            .unwrap_or_else(|| self.config.window.as_secs());

        if hits.len() >= self.config.max_requests {
            return RateLimitDecision {
                allowed: false,
                limit: self.config.max_requests,
                remaining: 0,
                reset_secs,
            };
        }

        hits.push_back(now);
        RateLimitDecision {
            allowed: true,
            limit: self.config.max_requests,
            remaining: self.config.max_requests - hits.len(),
            reset_secs,
        }
    }

    /// Drop clients whose whole window has expired.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.lock()
            .retain(|_, hits| hits.back().is_some_and(|&t| now - t < window));
    }

    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Derive the client identity: proxy headers first, then the socket.
pub fn client_id(headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real_ip.to_string();
    }
    addr.ip().to_string()
}

/// Handle to the periodic prune task.
#[derive(Debug)]
pub struct PruneHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PruneHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Sweep expired client windows once per rate-limit window.
pub fn spawn_prune(limiter: std::sync::Arc<RateLimiter>) -> PruneHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = limiter.config().window;
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => limiter.prune(),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    PruneHandle {
        shutdown: shutdown_tx,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window,
            max_requests: max,
        })
    }

    #[test]
    fn allows_up_to_the_limit_then_denies() {
        let limiter = limiter(3, Duration::from_secs(60));
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("10.0.0.1");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = limiter.check("10.0.0.1");
        assert!(!denied.allowed);
        assert!(denied.reset_secs >= 1);

        // Other clients are unaffected.
        assert!(limiter.check("10.0.0.2").allowed);
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let limiter = limiter(1, Duration::from_millis(10));
        assert!(limiter.check("c").allowed);
        assert!(!limiter.check("c").allowed);
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check("c").allowed);
    }

    #[test]
    fn prune_drops_idle_clients() {
        let limiter = limiter(5, Duration::from_millis(10));
        limiter.check("a");
        limiter.check("b");
        assert_eq!(limiter.tracked_clients(), 2);
        std::thread::sleep(Duration::from_millis(15));
        limiter.prune();
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn client_identity_prefers_proxy_headers() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_id(&headers, addr), "203.0.113.7");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.3".parse().unwrap());
        assert_eq!(client_id(&headers, addr), "198.51.100.3");

        assert_eq!(client_id(&HeaderMap::new(), addr), "127.0.0.1");
    }
}
