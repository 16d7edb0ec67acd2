//! # relay-client
//!
//! Client side of the relay engine:
//!
//! - **Connectors**: TCP frames or WebSocket JSON, behind one [`Connector`] trait
//! - **Client**: session notice, AUTH, request/reply correlation, push handlers
//! - **Keepalive**: periodic PING with RTT tracking after auth
//! - **Reconnect**: bounded auto-reconnect with re-authentication

#![deny(unsafe_code)]

pub mod client;
pub mod connector;
pub mod errors;
pub mod reconnect;

pub use client::{LinkState, MessageHandler, RelayClient};
pub use connector::{Connector, Link, TcpConnector, WsConnector};
pub use errors::{ClientError, Result};
pub use reconnect::{ReconnectAction, ReconnectController};
