//! HTTP proxy side of the local forwarder
//!
//! `CONNECT host:port` gets a `200 Connection established` and becomes a raw
//! tunnel. Plain requests (`GET http://host/path`) are sent to `host:80` with
//! the request line rewritten to origin form, then relayed as-is.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::dynamic::{bridge, SharedStats, TunnelConnector};
use crate::ssh::{read_header_block, SshError, MAX_PROXY_RESPONSE_BYTES};

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n";

/// Headers that belong to the hop between client and proxy
const HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProxyRequest {
    /// `CONNECT host:port`
    Connect { host: String, port: u16 },
    /// Any other method; `head` is the rewritten request head to send upstream
    Plain {
        host: String,
        port: u16,
        head: String,
    },
}

/// Split `host[:port]`, with bracketed IPv6 literals
fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, default_port),
        }
    };

    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

/// Parse the request head a proxy client sent
pub(crate) fn parse_request(head: &str) -> Result<ProxyRequest, String> {
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or("").trim();

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(format!("Invalid request line: {:?}", request_line));
    }
    let (method, target, version) = (parts[0], parts[1], parts[2]);

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(target, 443)
            .ok_or_else(|| format!("Invalid CONNECT target: {}", target))?;
        return Ok(ProxyRequest::Connect { host, port });
    }

    let headers: Vec<&str> = lines
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();

    let absolute = target
        .get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("http://"))
        .map(|_| &target[7..]);

    let (authority, path) = if let Some(rest) = absolute {
        match rest.find('/') {
            Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        }
    } else if target.starts_with('/') {
        let host = headers
            .iter()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("host")
                    .then(|| value.trim().to_string())
            })
            .ok_or_else(|| "Request without absolute URI or Host header".to_string())?;
        (host, target.to_string())
    } else {
        return Err(format!("Unsupported request target: {}", target));
    };

    let (host, port) =
        split_authority(&authority, 80).ok_or_else(|| format!("Invalid host: {}", authority))?;

    let mut rewritten = format!("{} {} {}\r\n", method, path, version);
    for line in headers {
        let name = line.split_once(':').map(|(n, _)| n.trim()).unwrap_or("");
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        rewritten.push_str(line);
        rewritten.push_str("\r\n");
    }
    rewritten.push_str("\r\n");

    Ok(ProxyRequest::Plain {
        host,
        port,
        head: rewritten,
    })
}

/// Handle a single HTTP proxy connection
pub(crate) async fn handle_http_connection(
    connector: &dyn TunnelConnector,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stats: &SharedStats,
) -> Result<(), SshError> {
    let head = read_header_block(&mut stream, MAX_PROXY_RESPONSE_BYTES)
        .await
        .map_err(|e| SshError::Forward(format!("Failed to read HTTP request: {}", e)))?;

    let request = match parse_request(&head) {
        Ok(request) => request,
        Err(message) => {
            let _ = stream.write_all(RESPONSE_BAD_REQUEST).await;
            return Err(SshError::Forward(message));
        }
    };

    let (host, port) = match &request {
        ProxyRequest::Connect { host, port } | ProxyRequest::Plain { host, port, .. } => {
            (host.clone(), *port)
        }
    };

    debug!("HTTP proxy: Connecting to {}:{}", host, port);

    let mut remote = match connector.connect(&host, port, peer_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Failed to open tunnel to {}:{}: {}", host, port, e);
            let _ = stream.write_all(RESPONSE_BAD_GATEWAY).await;
            return Err(e);
        }
    };

    match request {
        ProxyRequest::Connect { .. } => {
            stream
                .write_all(RESPONSE_ESTABLISHED)
                .await
                .map_err(|e| SshError::Forward(format!("Failed to answer CONNECT: {}", e)))?;
        }
        ProxyRequest::Plain { head, .. } => {
            remote
                .write_all(head.as_bytes())
                .await
                .map_err(|e| SshError::Forward(format!("Failed to forward request: {}", e)))?;
            stats.write().bytes_sent += head.len() as u64;
        }
    }

    bridge(stream, remote, stats).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::dynamic::tests::{spawn_echo_server, start_test_forward};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_split_authority() {
        assert_eq!(
            split_authority("example.com:8443", 443),
            Some(("example.com".to_string(), 8443))
        );
        assert_eq!(
            split_authority("example.com", 80),
            Some(("example.com".to_string(), 80))
        );
        assert_eq!(
            split_authority("[2001:db8::1]:443", 80),
            Some(("2001:db8::1".to_string(), 443))
        );
        assert_eq!(
            split_authority("[::1]", 80),
            Some(("::1".to_string(), 80))
        );
        assert_eq!(split_authority("example.com:http", 80), None);
        assert_eq!(split_authority(":443", 80), None);
    }

    #[test]
    fn test_parse_connect() {
        let request = parse_request("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(
            request,
            Ok(ProxyRequest::Connect {
                host: "example.com".to_string(),
                port: 443
            })
        );
    }

    #[test]
    fn test_parse_absolute_get() {
        let head = "GET http://example.com/index.html?q=1 HTTP/1.1\r\n\
                    Host: example.com\r\n\
                    Proxy-Connection: keep-alive\r\n\
                    Accept: */*\r\n\r\n";
        match parse_request(head).unwrap() {
            ProxyRequest::Plain { host, port, head } => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 80);
                assert_eq!(
                    head,
                    "GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
                );
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_origin_form_uses_host_header() {
        match parse_request("GET / HTTP/1.1\nHost: example.com:8080\n\n").unwrap() {
            ProxyRequest::Plain { host, port, .. } => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 8080);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request("HELLO\r\n\r\n").is_err());
        assert!(parse_request("GET ftp://example.com/ HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request("GET / HTTP/1.1\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_http_connect_through_forwarder() {
        let echo = spawn_echo_server().await;
        let (handle, _disconnect_tx) = start_test_forward().await;

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port()).as_bytes())
            .await
            .unwrap();

        let response = read_header_block(&mut client, 1024).await.unwrap();
        assert_eq!(response.as_bytes(), RESPONSE_ESTABLISHED);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn test_http_get_is_rewritten() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let head = read_header_block(&mut socket, 1024).await.unwrap();
            let body = head.lines().next().unwrap().to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let (handle, _disconnect_tx) = start_test_forward().await;
        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client
            .write_all(
                format!(
                    "GET http://127.0.0.1:{}/status HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                    origin_port
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("GET /status HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_http_bad_gateway() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let (handle, _disconnect_tx) = start_test_forward().await;
        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", closed_port).as_bytes())
            .await
            .unwrap();

        let response = read_header_block(&mut client, 1024).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502"));
    }
}
