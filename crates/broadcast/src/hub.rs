//! Subscriber registry and fan-out.
//!
//! Each session is an actor with a bounded outbound channel. Publishing
//! never blocks: frames are offered with `try_send`, and a session whose
//! buffer overflows is closed rather than stalling the hub.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use opspulse_core::{Event, Incident, SessionId};

use crate::frames::{CHANNEL_ALL, ClientFrame, IncidentAction, Outbound, ServerFrame};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound frames buffered per session before it is reaped.
    pub outbound_buffer: usize,
    /// Ping cycle; sessions silent for a full cycle are terminated.
    pub heartbeat_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Session {
    tx: mpsc::Sender<Outbound>,
    channels: HashSet<String>,
    paused: bool,
    last_seen: DateTime<Utc>,
}

impl Session {
    fn wants(&self, service: &str) -> bool {
        self.channels.contains(CHANNEL_ALL) || self.channels.contains(service)
    }
}

/// Fan-out hub. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    config: HubConfig,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new session and greet it.
    ///
    /// Returns the session id plus the outbound channel the transport must
    /// drain; dropping the receiver is equivalent to hanging up.
    pub fn attach(&self) -> (SessionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        let id = SessionId::new();
        let _ = tx.try_send(Outbound::Frame(ServerFrame::connection(
            "connected to opspulse event stream",
        )));
        let session = Session {
            tx,
            channels: HashSet::from([CHANNEL_ALL.to_string()]),
            paused: false,
            last_seen: Utc::now(),
        };
        self.write().insert(id, session);
        tracing::debug!(session = %id, "subscriber attached");
        (id, rx)
    }

    pub fn detach(&self, id: SessionId) {
        if self.write().remove(&id).is_some() {
            tracing::debug!(session = %id, "subscriber detached");
        }
    }

    /// Replace the session's channel set; an empty list means `{all}`.
    pub fn subscribe(&self, id: SessionId, channels: Vec<String>) {
        let mut sessions = self.write();
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        let channels = if channels.is_empty() {
            vec![CHANNEL_ALL.to_string()]
        } else {
            channels
        };
        session.channels = channels.iter().cloned().collect();
        session.last_seen = Utc::now();
        let _ = session
            .tx
            .try_send(Outbound::Frame(ServerFrame::subscribed(channels)));
    }

    /// Suppress event frames for this session until `resume`.
    pub fn pause(&self, id: SessionId, _at: Option<DateTime<Utc>>) {
        if let Some(session) = self.write().get_mut(&id) {
            session.paused = true;
            session.last_seen = Utc::now();
        }
    }

    pub fn resume(&self, id: SessionId) {
        if let Some(session) = self.write().get_mut(&id) {
            session.paused = false;
            session.last_seen = Utc::now();
        }
    }

    /// Record liveness for a session (transport saw a pong or any traffic).
    pub fn touch(&self, id: SessionId) {
        if let Some(session) = self.write().get_mut(&id) {
            session.last_seen = Utc::now();
        }
    }

    /// Dispatch one inbound control frame already parsed by the transport.
    pub fn handle_frame(&self, id: SessionId, frame: ClientFrame) {
        match frame {
            ClientFrame::Subscribe { channels } => self.subscribe(id, channels),
            ClientFrame::Ping => {
                let mut sessions = self.write();
                if let Some(session) = sessions.get_mut(&id) {
                    session.last_seen = Utc::now();
                    let _ = session.tx.try_send(Outbound::Frame(ServerFrame::pong()));
                }
            }
            ClientFrame::Pause { timestamp } => self.pause(id, timestamp),
            ClientFrame::Resume => self.resume(id),
        }
    }

    /// Tell a session its last message was not understood.
    pub fn reject_frame(&self, id: SessionId, message: impl Into<String>) {
        let sessions = self.read();
        if let Some(session) = sessions.get(&id) {
            let _ = session
                .tx
                .try_send(Outbound::Frame(ServerFrame::error(message)));
        }
    }

    /// Deliver an event to every unpaused session subscribed to its service.
    pub fn publish_event(&self, event: &Event) {
        let frame = ServerFrame::event(event.clone());
        self.fan_out(|session| {
            if session.paused || !session.wants(&event.service) {
                None
            } else {
                Some(Outbound::Frame(frame.clone()))
            }
        });
    }

    /// Deliver an incident mutation to every unpaused session, regardless of
    /// channel subscriptions.
    pub fn publish_incident(&self, incident: &Incident, action: IncidentAction) {
        let frame = ServerFrame::incident(incident.clone(), action);
        self.fan_out(|session| {
            if session.paused {
                None
            } else {
                Some(Outbound::Frame(frame.clone()))
            }
        });
    }

    /// Offer a frame to each session; overflowing sessions are reaped.
    fn fan_out(&self, mut select: impl FnMut(&Session) -> Option<Outbound>) {
        let mut dead = Vec::new();
        {
            let sessions = self.read();
            for (id, session) in sessions.iter() {
                let Some(outbound) = select(session) else {
                    continue;
                };
                match session.tx.try_send(outbound) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(session = %id, "outbound buffer overflow, closing session");
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut sessions = self.write();
            for id in dead {
                sessions.remove(&id);
            }
        }
    }

    /// One heartbeat sweep: reap silent sessions, ping the rest.
    pub fn heartbeat(&self) {
        let cycle = chrono::Duration::from_std(self.config.heartbeat_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let now = Utc::now();
        let mut dead = Vec::new();
        {
            let sessions = self.read();
            for (id, session) in sessions.iter() {
                if now - session.last_seen > cycle {
                    tracing::info!(session = %id, "no heartbeat response, terminating session");
                    dead.push(*id);
                    continue;
                }
                if session.tx.try_send(Outbound::Ping).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut sessions = self.write();
            for id in dead {
                sessions.remove(&id);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.read().len()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Session>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the heartbeat worker.
#[derive(Debug)]
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Spawn the periodic ping/reap sweep for a hub.
pub fn spawn_heartbeat(hub: std::sync::Arc<BroadcastHub>) -> HeartbeatHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = hub.heartbeat_interval();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so a fresh session is not
        // pinged before it finishes the handshake.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => hub.heartbeat(),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    HeartbeatHandle {
        shutdown: shutdown_tx,
        join,
    }
}
