//! wsrelay agent
//!
//! Serves controller connections and multiplexes token-addressed socket,
//! filesystem, resolver and authentication operations over each of them.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod fileops;
pub mod handler;
pub mod info;
pub mod metrics;
pub mod outbound;
pub mod registry;
pub mod resolver;
pub mod session;


pub use config::AgentConfig;
pub use dispatcher::CommandDispatcher;
pub use handler::{Server, serve_connection};
