//! Outbound attempt state machine
//!
//! An [`Attempt`] is the handler-side state of one logical outbound
//! connection while it is still connecting: which phase it is in, which
//! resolved addresses remain to try, and how much retry budget is left. The
//! handler drives transitions; the async functions here perform exactly one
//! network step each so that every per-address failure surfaces as its own
//! callback before the next step starts.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Destination;
use crate::error::ConnectError;

/// Where an outbound attempt currently stands
#[derive(Debug)]
pub(crate) enum AttemptPhase {
    /// Connecting straight to a literal address
    Direct { addr: SocketAddr },
    /// Waiting on DNS
    Resolving,
    /// Walking a resolved address list
    Iterating {
        addrs: Vec<SocketAddr>,
        cursor: usize,
    },
    /// Tunneling through the destination's proxy
    Proxy,
}

/// State of one in-flight outbound connection
#[derive(Debug)]
pub(crate) struct Attempt {
    pub dest: Destination,
    pub phase: AttemptPhase,
    retries_remaining: i32,
}

impl Attempt {
    /// Select the variant for a destination and prime the retry budget
    pub(crate) fn new(dest: Destination) -> Self {
        let retries_remaining = dest.retries;
        let phase = if dest.proxy.is_some() {
            AttemptPhase::Proxy
        } else if let Some(addr) = dest.literal_addr() {
            AttemptPhase::Direct { addr }
        } else {
            AttemptPhase::Resolving
        };
        Self {
            dest,
            phase,
            retries_remaining,
        }
    }

    /// Remaining retry budget (`-1` means infinite)
    #[cfg(test)]
    pub(crate) const fn retries_remaining(&self) -> i32 {
        self.retries_remaining
    }

    /// Consume one unit of retry budget
    ///
    /// Returns whether a retry may be attempted; see
    /// [`consume_retry`](super::consume_retry) for the decrement rules.
    pub(crate) fn consume_retry(&mut self) -> bool {
        super::consume_retry(&mut self.retries_remaining)
    }

    /// Enter the iterating phase with a fresh address list
    pub(crate) fn set_resolved(&mut self, addrs: Vec<SocketAddr>) {
        debug_assert!(!addrs.is_empty());
        self.phase = AttemptPhase::Iterating { addrs, cursor: 0 };
    }

    /// The address the current step is (or was) connecting to
    pub(crate) fn current_addr(&self) -> Option<SocketAddr> {
        match &self.phase {
            AttemptPhase::Direct { addr } => Some(*addr),
            AttemptPhase::Iterating { addrs, cursor } => addrs.get(*cursor).copied(),
            AttemptPhase::Resolving | AttemptPhase::Proxy => None,
        }
    }

    /// Advance past a failed address
    ///
    /// Returns `true` while more addresses remain in this resolution round.
    /// When the round is exhausted the attempt falls back to `Resolving` so
    /// the next step re-resolves; walking the list does not touch the retry
    /// budget, starting a new round does (the caller decides via
    /// [`consume_retry`](Self::consume_retry)).
    pub(crate) fn advance_cursor(&mut self) -> bool {
        if let AttemptPhase::Iterating { addrs, cursor } = &mut self.phase {
            *cursor += 1;
            if *cursor < addrs.len() {
                return true;
            }
            self.phase = AttemptPhase::Resolving;
        }
        false
    }
}

/// Connect to one address with the per-attempt timeout
pub(crate) async fn connect_direct(
    addr: SocketAddr,
    connect_timeout: Duration,
    keepalive: bool,
) -> Result<TcpStream, ConnectError> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectError::Timeout {
            addr,
            timeout_secs: connect_timeout.as_secs(),
        })?
        .map_err(|e| ConnectError::failed(addr, e.to_string()))?;

    configure_stream(&stream, keepalive)?;

    debug!(addr = %addr, "connection established");
    Ok(stream)
}

/// Apply the socket options every established stream carries
pub(crate) fn configure_stream(stream: &TcpStream, keepalive: bool) -> Result<(), ConnectError> {
    stream
        .set_nodelay(true)
        .map_err(|e| ConnectError::SocketOption {
            option: "TCP_NODELAY".into(),
            reason: e.to_string(),
        })?;

    if keepalive {
        let ka = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));
        SockRef::from(stream)
            .set_tcp_keepalive(&ka)
            .map_err(|e| ConnectError::SocketOption {
                option: "TCP_KEEPALIVE".into(),
                reason: e.to_string(),
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, ResolveMode};

    fn dest(host: &str, retries: i32) -> Destination {
        Destination::new(host, 8333).with_retries(retries)
    }

    #[test]
    fn test_variant_selection() {
        let a = Attempt::new(dest("203.0.113.7", 0));
        assert!(matches!(a.phase, AttemptPhase::Direct { .. }));

        let a = Attempt::new(dest("seed.example.org", 0));
        assert!(matches!(a.phase, AttemptPhase::Resolving));

        let proxied = dest("seed.example.org", 0)
            .with_proxy(ProxyConfig::new("127.0.0.1:1080".parse().unwrap()));
        let a = Attempt::new(proxied);
        assert!(matches!(a.phase, AttemptPhase::Proxy));

        // A literal host behind a proxy still goes through the proxy
        let proxied_literal =
            dest("203.0.113.7", 0).with_proxy(ProxyConfig::new("127.0.0.1:1080".parse().unwrap()));
        assert!(matches!(
            Attempt::new(proxied_literal).phase,
            AttemptPhase::Proxy
        ));
    }

    #[test]
    fn test_no_resolve_literal_is_direct() {
        let d = dest("203.0.113.7", 0).with_resolve_mode(ResolveMode::NoResolve);
        assert!(matches!(Attempt::new(d).phase, AttemptPhase::Direct { .. }));
    }

    #[test]
    fn test_retry_budget_decrements_to_zero() {
        let mut a = Attempt::new(dest("seed.example.org", 2));
        assert!(a.consume_retry());
        assert_eq!(a.retries_remaining(), 1);
        assert!(a.consume_retry());
        assert_eq!(a.retries_remaining(), 0);
        assert!(!a.consume_retry());
        assert_eq!(a.retries_remaining(), 0, "budget never goes below zero");
    }

    #[test]
    fn test_negative_budget_is_infinite() {
        let mut a = Attempt::new(dest("seed.example.org", -1));
        for _ in 0..100 {
            assert!(a.consume_retry());
        }
        assert_eq!(a.retries_remaining(), -1);
    }

    #[test]
    fn test_cursor_walk_and_exhaustion() {
        let mut a = Attempt::new(dest("seed.example.org", 1));
        let addrs: Vec<SocketAddr> = vec![
            "198.51.100.1:8333".parse().unwrap(),
            "198.51.100.2:8333".parse().unwrap(),
        ];
        a.set_resolved(addrs.clone());

        assert_eq!(a.current_addr(), Some(addrs[0]));
        assert!(a.advance_cursor(), "second address remains");
        assert_eq!(a.current_addr(), Some(addrs[1]));
        assert_eq!(a.retries_remaining(), 1, "walking the list is free");

        assert!(!a.advance_cursor(), "list exhausted");
        assert!(matches!(a.phase, AttemptPhase::Resolving));
        assert!(a.consume_retry(), "new round consumes budget");
        assert!(!a.consume_retry());
    }

    #[tokio::test]
    async fn test_connect_direct_refused() {
        // Bind then drop to get a port with nothing listening
        let sock = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        drop(sock);

        let err = connect_direct(addr, Duration::from_secs(1), false)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_connect_direct_success_sets_nodelay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = connect_direct(addr, Duration::from_secs(5), true)
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }
}
