//! peernet: peer-to-peer connection management core
//!
//! This crate provides the connection-handling core of an overlay network
//! node: it dials and maintains a population of outbound TCP connections,
//! accepts inbound connections on bound listeners, frames byte streams into
//! application messages, and throttles traffic with shared and per-connection
//! rate limits.
//!
//! # Architecture
//!
//! ```text
//! Embedder ── destinations / listeners ──▶ ConnectionHandler (event loop)
//!     ▲                                        │
//!     │  callbacks (NetworkEvents)             ├─ Direct / DNS / Proxy dialing
//!     │                                        ├─ Listeners + incoming
//!     └──── HandlerControl (any thread) ──────▶├─ Framing + rate limits
//!                                              └─ Retry under fresh ids
//! ```
//!
//! All connection state lives in a single event loop. The embedder either
//! drives it directly with [`ConnectionHandler::pump`] or moves it onto a
//! task with [`ConnectionHandler::spawn`]; cross-thread commands (`send`,
//! `close`, rate limit changes, `shutdown`) go through [`HandlerControl`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use peernet::{ConnectionHandler, Destination, HandlerConfig, NetworkEvents};
//!
//! struct Node;
//!
//! impl NetworkEvents for Node {
//!     fn on_need_outgoing(&self, _need: usize) -> Vec<Destination> {
//!         vec![Destination::new("203.0.113.7", 8333)]
//!     }
//!
//!     fn on_ready_for_first_send(&self, id: peernet::ConnId) {
//!         println!("connection {id} is up");
//!     }
//! }
//!
//! # async fn example() {
//! let mut handler = ConnectionHandler::new(HandlerConfig::default(), Arc::new(Node));
//! handler.start(8).unwrap();
//! while handler.pump(true).await {}
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: destinations, limits, rate descriptors
//! - [`error`]: error types
//! - [`events`]: the embedder callback trait
//! - [`framing`]: message framing
//! - [`handler`]: the connection handler and its control surface
//! - [`rate`]: byte token buckets
//! - [`resolver`]: the resolution seam

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
mod conn;
pub mod error;
pub mod events;
pub mod framing;
pub mod handler;
mod listener;
pub mod rate;
pub mod resolver;

pub use config::{
    Destination, HandlerConfig, ProxyConfig, RateLimit, ResolveFamily, ResolveMode, RATE_LIMIT_MAX,
};
pub use conn::ConnId;
pub use error::{
    BindError, ConnectError, FramingError, HandlerError, NetError, ProxyError, ResolveError,
};
pub use events::NetworkEvents;
pub use framing::{LengthDelimitedFramer, MessageFramer};
pub use handler::{ConnectionHandler, HandlerControl, HandlerStats, StatsSnapshot};
pub use rate::RateGroup;
pub use resolver::{Resolver, SystemResolver};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
