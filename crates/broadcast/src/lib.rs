//! Real-time fan-out: session registry, per-channel filtering, heartbeats.

pub mod frames;
pub mod hub;

pub use frames::{ClientFrame, IncidentAction, Outbound, ServerFrame, CHANNEL_ALL};
pub use hub::{BroadcastHub, HeartbeatHandle, HubConfig, spawn_heartbeat};
