//! Embedder interface
//!
//! The handler consults the host application and delivers every observable
//! event through the [`NetworkEvents`] trait. All callbacks are invoked from
//! the handler's event loop, never re-entrantly from a command that
//! originated on another thread, and callbacks for one connection id are
//! totally ordered.

use bytes::Bytes;

use crate::config::Destination;
use crate::conn::ConnId;
use crate::framing::{LengthDelimitedFramer, MessageFramer};
use crate::handler::ConnectionHandler;

/// Callback surface the handler drives
///
/// Every method has a default so embedders implement only what they observe.
/// The ordering contract per connection id is:
/// `on_outgoing_connection`/`on_incoming_connection`, then
/// `on_ready_for_first_send` (outgoing only), then any number of
/// `on_receive_messages` and write-buffer notifications, then exactly one
/// `on_disconnected`. Nothing is delivered for an id after its
/// `on_disconnected`.
#[allow(unused_variables)]
pub trait NetworkEvents: Send + Sync {
    /// The handler finished starting; bind listeners and seed connections
    /// here, the argument is the only mutable access while the loop runs
    fn on_startup(&self, handler: &mut ConnectionHandler) {}

    /// The handler finished shutting down; all maps are empty
    fn on_shutdown(&self) {}

    /// The handler has `need` free outbound slots; return up to that many
    /// destinations (fewer is fine, unset entries are skipped)
    fn on_need_outgoing(&self, need: usize) -> Vec<Destination> {
        Vec::new()
    }

    /// A listener failed after binding and was removed
    fn on_bind_failure(&self, bind: &Destination) {}

    /// A resolve-only request completed
    fn on_dns_response(&self, requested: &Destination, resolved: Vec<Destination>) {}

    /// A DNS lookup failed; `will_retry` says whether it re-arms
    fn on_dns_failure(&self, requested: &Destination, will_retry: bool) {}

    /// An outbound connection reached its peer
    fn on_outgoing_connection(&self, id: ConnId, requested: &Destination, resolved: &Destination) {}

    /// An inbound connection was accepted on `bind`; return `false` to drop
    /// it before it counts
    fn on_incoming_connection(&self, id: ConnId, bind: &Destination, resolved: &Destination) -> bool {
        true
    }

    /// A transport connect failed; on `will_retry` the same logical
    /// connection re-attempts under a fresh id
    fn on_connection_failure(
        &self,
        requested: &Destination,
        resolved: &Destination,
        will_retry: bool,
    ) {
    }

    /// The proxy dialogue failed
    fn on_proxy_failure(&self, requested: &Destination, will_retry: bool) {}

    /// The outbound connection is writable for the first time
    fn on_ready_for_first_send(&self, id: ConnId) {}

    /// Complete inbound messages arrived; return `false` to close the
    /// connection
    fn on_receive_messages(&self, id: ConnId, messages: Vec<Bytes>, total_size: usize) -> bool {
        true
    }

    /// The write buffer crossed its high watermark
    fn on_write_buffer_full(&self, id: ConnId, bufsize: usize) {}

    /// The write buffer drained below its low watermark
    fn on_write_buffer_ready(&self, id: ConnId, bufsize: usize) {}

    /// The framer rejected the inbound stream; the connection closes
    fn on_malformed_message(&self, id: ConnId) {}

    /// The connection is gone; on `reconnect` a new attempt follows under a
    /// fresh id
    fn on_disconnected(&self, id: ConnId, reconnect: bool) {}

    /// Build the framer for a new connection from its destination's opaque
    /// network-config blob
    fn create_framer(&self, net_config: &[u8]) -> Box<dyn MessageFramer> {
        Box::new(LengthDelimitedFramer::default())
    }
}
