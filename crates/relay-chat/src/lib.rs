//! # relay-chat
//!
//! Demo chat service on the relay engine: accounts with presence, a bounded
//! chat log, five request protocols and a MESSAGE broadcast.

#![deny(unsafe_code)]

pub mod bodies;
pub mod errors;
pub mod log;
pub mod protocols;
pub mod users;

use std::sync::Arc;

use relay_server::RelayServer;
use relay_settings::ServerSettings;

pub use errors::{ChatError, Result};
pub use log::{ChatLog, ChatMessage, MessageKind};
pub use protocols::{ChatService, GET_USER_INFO, GET_USER_LIST, MESSAGE, OFFLINE, ONLINE, SAY};
pub use users::{Account, UserInfo, UserStore};

/// Server builder with the chat protocols, verifier and presence hook wired in.
pub fn build_server(service: &Arc<ChatService>, settings: ServerSettings) -> RelayServer {
    RelayServer::new(settings)
        .with_verifier(service.users().clone())
        .with_hook(service.presence())
        .scan(service.protocols())
}
