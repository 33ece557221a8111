//! Bound listeners
//!
//! A [`PeerListener`] is a non-blocking TCP listener created from a bind
//! descriptor. Once enabled it runs an accept task that hands every accepted
//! socket to the handler loop; the handler then builds the incoming
//! connection and consults the embedder.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Destination;
use crate::conn::ConnId;
use crate::error::BindError;
use crate::handler::LoopEvent;

/// A bound, optionally accepting, TCP listener
#[derive(Debug)]
pub(crate) struct PeerListener {
    id: ConnId,
    dest: Destination,
    local_addr: SocketAddr,
    /// Present until the listener is enabled
    listener: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
}

impl PeerListener {
    /// Create and bind the listener socket
    ///
    /// The bind host must be a literal address. The socket gets
    /// `SO_REUSEADDR` and non-blocking mode before binding.
    pub(crate) fn bind(id: ConnId, dest: Destination, backlog: u32) -> Result<Self, BindError> {
        let addr = dest.literal_addr().ok_or_else(|| BindError::NotLiteral {
            host: dest.host.clone(),
        })?;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| BindError::SocketCreation(e.to_string()))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| BindError::socket_option("SO_REUSEADDR", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| BindError::socket_option("O_NONBLOCK", e.to_string()))?;

        socket.bind(&addr.into()).map_err(|e| BindError::Bind {
            addr,
            reason: e.to_string(),
        })?;
        socket
            .listen(backlog as i32)
            .map_err(|e| BindError::socket_option("listen", e.to_string()))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| BindError::SocketCreation(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::SocketCreation(e.to_string()))?;

        info!(addr = %local_addr, backlog, "listener bound");

        Ok(Self {
            id,
            dest,
            local_addr,
            listener: Some(listener),
            accept_task: None,
        })
    }

    /// Start accepting, feeding sockets into the handler loop
    pub(crate) fn enable(&mut self, events_tx: mpsc::UnboundedSender<LoopEvent>) {
        if let Some(listener) = self.listener.take() {
            let id = self.id;
            self.accept_task = Some(tokio::spawn(accept_loop(id, listener, events_tx)));
        }
    }

    /// The bind descriptor this listener was created from
    pub(crate) fn dest(&self) -> &Destination {
        &self.dest
    }

    /// The locally bound address (concrete port for port-0 binds)
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        if let Some(task) = &self.accept_task {
            task.abort();
        }
    }
}

/// Transient accept errors worth retrying instead of tearing down
fn accept_error_is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

async fn accept_loop(
    bind_id: ConnId,
    listener: TcpListener,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted connection");
                if events_tx
                    .send(LoopEvent::Accepted {
                        bind_id,
                        stream,
                        peer,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if accept_error_is_transient(&e) => {
                debug!(error = %e, "transient accept error");
            }
            Err(e) => {
                warn!(error = %e, "listener failed, tearing down");
                let _ = events_tx.send(LoopEvent::ListenFailed {
                    bind_id,
                    error: BindError::Accept(e.to_string()),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_and_accept() {
        let dest = Destination::new("127.0.0.1", 0);
        let mut listener = PeerListener::bind(1, dest, 16).unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0, "port-0 bind reports concrete port");

        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.enable(tx);

        let _client = TcpStream::connect(addr).await.unwrap();
        match rx.recv().await.unwrap() {
            LoopEvent::Accepted { bind_id, peer, .. } => {
                assert_eq!(bind_id, 1);
                assert_eq!(peer.ip(), addr.ip());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bind_rejects_hostname() {
        let dest = Destination::new("localhost", 0);
        let err = PeerListener::bind(1, dest, 16).unwrap_err();
        assert!(matches!(err, BindError::NotLiteral { .. }));
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = PeerListener::bind(1, Destination::new("127.0.0.1", 0), 16).unwrap();
        let taken = first.local_addr();

        let err =
            PeerListener::bind(2, Destination::new("127.0.0.1", taken.port()), 16).unwrap_err();
        assert!(matches!(err, BindError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_drop_stops_accepting() {
        let dest = Destination::new("127.0.0.1", 0);
        let mut listener = PeerListener::bind(1, dest, 16).unwrap();
        let addr = listener.local_addr();

        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.enable(tx);
        drop(listener);

        // Accept task is gone; connects may still land in the kernel backlog
        // but nothing reaches the channel, which closes with the task
        let _ = TcpStream::connect(addr).await;
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(got.is_none(), "no accepted event after drop");
    }
}
