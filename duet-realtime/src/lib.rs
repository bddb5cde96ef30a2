//! Duet realtime - STOMP over WebSocket sync for a pairing.
//!
//! Provides:
//! - `stomp`: STOMP 1.2 frame codec and heartbeat negotiation
//! - `topics`: the per-pairing topics and their destinations
//! - `events`: wire payloads and the events delivered to the app
//! - `transport`: the connector seam and its WebSocket implementation
//! - `client`: the reconnecting session client

pub mod client;
pub mod events;
pub mod stomp;
pub mod topics;
pub mod transport;

pub use client::{ClientSettings, Credential, ReconnectPolicy, RealtimeClient};
pub use events::{ConnectionState, EventSink, SyncEvent};
pub use stomp::{Command, Frame, Heartbeat, Packet};
pub use topics::Topic;
pub use transport::{Connector, Link, WsConnector};
