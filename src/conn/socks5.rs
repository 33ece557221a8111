//! SOCKS5 proxy dialogue (RFC 1928, RFC 1929)
//!
//! The proxy variant reaches its destination by connecting to the proxy
//! server, negotiating authentication, and issuing a CONNECT for the target.
//! Hostname targets are sent as domain addresses so the proxy performs the
//! resolution; literal targets are sent as-is.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::attempt::connect_direct;
use crate::config::{Destination, ProxyConfig};
use crate::error::{ConnectError, ProxyError};

/// SOCKS5 protocol version
const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
const AUTH_METHOD_NONE: u8 = 0x00;
/// Username/password authentication (RFC 1929)
const AUTH_METHOD_PASSWORD: u8 = 0x02;
/// Server rejects all offered methods
const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
/// Username/password sub-negotiation version
const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type
const ATYP_IPV4: u8 = 0x01;
/// Domain name address type
const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type
const ATYP_IPV6: u8 = 0x04;

/// CONNECT succeeded
const REPLY_SUCCEEDED: u8 = 0x00;

/// Convert a reply code to a human-readable message
const fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// How a proxied connect failed
///
/// Transport failures (reaching the proxy) and dialogue failures (the proxy
/// protocol itself) surface through different embedder callbacks.
#[derive(Debug)]
pub(crate) enum ProxyFailure {
    Transport(ConnectError),
    Dialogue(ProxyError),
}

/// Establish a tunnel to `target` through its SOCKS5 proxy
///
/// Returns the tunneled stream and, when the target host was a literal
/// address, that address for resolved-destination reporting.
pub(crate) async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target: &Destination,
    attempt_timeout: Duration,
    keepalive: bool,
) -> Result<(TcpStream, Option<SocketAddr>), ProxyFailure> {
    let mut stream = connect_direct(proxy.addr, attempt_timeout, keepalive)
        .await
        .map_err(ProxyFailure::Transport)?;

    let dialogue = async {
        negotiate_method(&mut stream, proxy).await?;
        send_connect(&mut stream, target).await?;
        read_connect_reply(&mut stream).await
    };

    match timeout(attempt_timeout, dialogue).await {
        Ok(Ok(())) => {
            debug!(proxy = %proxy.addr, target = %target, "proxy tunnel established");
            Ok((stream, target.literal_addr()))
        }
        Ok(Err(e)) => Err(ProxyFailure::Dialogue(e)),
        Err(_) => Err(ProxyFailure::Dialogue(ProxyError::HandshakeTimeout)),
    }
}

/// Method selection and, if required, RFC 1929 authentication
async fn negotiate_method(stream: &mut TcpStream, proxy: &ProxyConfig) -> Result<(), ProxyError> {
    let greeting: &[u8] = if proxy.has_auth() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };

    stream
        .write_all(greeting)
        .await
        .map_err(|e| ProxyError::Stream(format!("write greeting failed: {e}")))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| ProxyError::Stream(format!("read method response failed: {e}")))?;

    trace!("SOCKS5 method response: {:?}", response);

    if response[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: response[0],
        });
    }

    match response[1] {
        AUTH_METHOD_NONE => Ok(()),
        AUTH_METHOD_PASSWORD => authenticate(stream, proxy).await,
        AUTH_METHOD_NO_ACCEPTABLE => Err(ProxyError::NoAcceptableMethod),
        other => Err(ProxyError::Protocol(format!(
            "unsupported auth method: {other:#04x}"
        ))),
    }
}

/// Username/password authentication (RFC 1929)
async fn authenticate(stream: &mut TcpStream, proxy: &ProxyConfig) -> Result<(), ProxyError> {
    let (Some(username), Some(password)) = (&proxy.username, &proxy.password) else {
        return Err(ProxyError::AuthFailed);
    };

    if username.len() > 255 || password.len() > 255 {
        return Err(ProxyError::Protocol(
            "credentials exceed 255 bytes".into(),
        ));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| ProxyError::Stream(format!("write auth failed: {e}")))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| ProxyError::Stream(format!("read auth response failed: {e}")))?;

    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(ProxyError::Protocol(format!(
            "invalid auth version: {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(ProxyError::AuthFailed);
    }

    trace!("SOCKS5 authentication successful");
    Ok(())
}

/// Issue the CONNECT request for the target endpoint
async fn send_connect(stream: &mut TcpStream, target: &Destination) -> Result<(), ProxyError> {
    let request = build_connect_request(target)?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| ProxyError::Stream(format!("write connect failed: {e}")))
}

/// Build the CONNECT request bytes for a destination
fn build_connect_request(target: &Destination) -> Result<Vec<u8>, ProxyError> {
    let mut request = Vec::with_capacity(22);
    request.push(SOCKS5_VERSION);
    request.push(CMD_CONNECT);
    request.push(0x00); // reserved

    match target.literal_addr() {
        Some(SocketAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.ip().octets());
        }
        Some(SocketAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.ip().octets());
        }
        None => {
            if target.host.len() > 255 {
                return Err(ProxyError::Protocol("domain exceeds 255 bytes".into()));
            }
            request.push(ATYP_DOMAIN);
            request.push(target.host.len() as u8);
            request.extend_from_slice(target.host.as_bytes());
        }
    }

    request.extend_from_slice(&target.port.to_be_bytes());
    Ok(request)
}

/// Read and validate the CONNECT reply, discarding the bound address
async fn read_connect_reply(stream: &mut TcpStream) -> Result<(), ProxyError> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| ProxyError::Stream(format!("read reply header failed: {e}")))?;

    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: header[0],
        });
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(ProxyError::ConnectRefused {
            code: header[1],
            message: reply_message(header[1]).to_string(),
        });
    }

    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| ProxyError::Stream(format!("read domain len failed: {e}")))?;
            len[0] as usize
        }
        other => return Err(ProxyError::Protocol(format!("invalid address type: {other:#04x}"))),
    };

    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| ProxyError::Stream(format!("read bound address failed: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_connect_request_literal_v4() {
        let target = Destination::new("198.51.100.9", 8333);
        let req = build_connect_request(&target).unwrap();

        assert_eq!(&req[..4], &[0x05, 0x01, 0x00, ATYP_IPV4]);
        assert_eq!(&req[4..8], &[198, 51, 100, 9]);
        assert_eq!(&req[8..], &8333u16.to_be_bytes());
    }

    #[test]
    fn test_connect_request_domain() {
        let target = Destination::new("peer.example.org", 8333);
        let req = build_connect_request(&target).unwrap();

        assert_eq!(&req[..4], &[0x05, 0x01, 0x00, ATYP_DOMAIN]);
        assert_eq!(req[4] as usize, "peer.example.org".len());
        assert_eq!(&req[5..5 + 16], b"peer.example.org");
    }

    #[test]
    fn test_connect_request_oversized_domain() {
        let target = Destination::new("x".repeat(256), 8333);
        assert!(matches!(
            build_connect_request(&target),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[test]
    fn test_reply_messages() {
        assert_eq!(reply_message(0x00), "succeeded");
        assert_eq!(reply_message(0x05), "connection refused");
        assert_eq!(reply_message(0x99), "unknown error");
    }

    /// Minimal scripted SOCKS5 server: no auth, accepts one CONNECT
    async fn scripted_proxy(listener: TcpListener, reply_code: u8) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[0], SOCKS5_VERSION);
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE])
            .await
            .unwrap();

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[1], CMD_CONNECT);
        let skip = match header[3] {
            ATYP_IPV4 => 6,
            ATYP_IPV6 => 18,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                len[0] as usize + 2
            }
            _ => panic!("bad atyp"),
        };
        let mut rest = vec![0u8; skip];
        stream.read_exact(&mut rest).await.unwrap();

        stream
            .write_all(&[SOCKS5_VERSION, reply_code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        // Hold the tunnel open briefly so the client sees success
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_tunnel_established() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let server = tokio::spawn(scripted_proxy(listener, REPLY_SUCCEEDED));

        let proxy = ProxyConfig::new(proxy_addr);
        let target = Destination::new("198.51.100.9", 8333);

        let (stream, literal) = connect_via_proxy(&proxy, &target, Duration::from_secs(5), false)
            .await
            .unwrap();
        assert_eq!(literal, Some("198.51.100.9:8333".parse().unwrap()));
        drop(stream);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_dialogue_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let server = tokio::spawn(scripted_proxy(listener, 0x05));

        let proxy = ProxyConfig::new(proxy_addr);
        let target = Destination::new("peer.example.org", 8333);

        let err = connect_via_proxy(&proxy, &target, Duration::from_secs(5), false)
            .await
            .err()
            .expect("refused reply must fail");
        match err {
            ProxyFailure::Dialogue(ProxyError::ConnectRefused { code, .. }) => {
                assert_eq!(code, 0x05);
            }
            _ => panic!("expected dialogue failure"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_transport_failure() {
        let sock = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        drop(sock);

        let proxy = ProxyConfig::new(addr);
        let target = Destination::new("peer.example.org", 8333);

        let err = connect_via_proxy(&proxy, &target, Duration::from_secs(1), false)
            .await
            .err()
            .expect("dead proxy must fail");
        assert!(matches!(err, ProxyFailure::Transport(_)));
    }
}
