//! HTTP Payload Proxy Dialer
//!
//! Opens the transport for the SSH session through an HTTP(S) proxy:
//!
//! ```text
//! Client --TCP--> [TLS, spoofed SNI] --payload--> Proxy --> sshHost:sshPort
//! ```
//!
//! 1. TCP connect to the proxy
//! 2. Optional TLS handshake, ClientHello server name = SNI
//! 3. Send the rendered payload template
//! 4. Read the response header up to the blank line, require `HTTP/1.x 200`
//!
//! After that the stream belongs to SSH. The header is read one byte at a time
//! so the server banner that may follow it stays in the stream.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::tls;
use crate::config::TunnelConfig;

/// Upper bound for the proxy response header
pub const MAX_PROXY_RESPONSE_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to connect to proxy {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Proxy IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Proxy closed connection unexpectedly")]
    UnexpectedEof,

    #[error("Proxy responded with an error: {status_line}")]
    Rejected { status_line: String },

    #[error("Proxy response header exceeds {0} bytes")]
    HeaderTooLarge(usize),
}

/// Byte stream the SSH session runs over
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

pub type BoxedStream = Box<dyn TransportStream>;

/// Substitute the payload placeholders and turn escape markers into line terminators
///
/// `[host_port]`, `[ssh_host]`, `[ssh_port]` and `[protocol]` are replaced;
/// the two-character sequences `\r` and `\n` become CR and LF.
pub fn render_payload(template: &str, ssh_host: &str, ssh_port: u16) -> String {
    template
        .replace("[host_port]", &format!("{}:{}", ssh_host, ssh_port))
        .replace("[ssh_host]", ssh_host)
        .replace("[ssh_port]", &ssh_port.to_string())
        .replace("[protocol]", "HTTP/1.1")
        .replace("\\r", "\r")
        .replace("\\n", "\n")
}

/// Read an HTTP header block up to and including the blank line
///
/// EOF before the first byte is an error; EOF later ends the header. Nothing
/// past the blank line is consumed.
pub async fn read_header_block<R>(reader: &mut R, budget: usize) -> Result<String, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if header.is_empty() {
                return Err(ProxyError::UnexpectedEof);
            }
            break;
        }

        header.push(byte[0]);
        if header.ends_with(b"\r\n\r\n") || header.ends_with(b"\n\n") {
            break;
        }
        if header.len() >= budget {
            return Err(ProxyError::HeaderTooLarge(budget));
        }
    }

    Ok(String::from_utf8_lossy(&header).into_owned())
}

/// Accept only `HTTP/1.x ... 200 ...` status lines
pub fn check_status_line(header: &str) -> Result<(), ProxyError> {
    let status_line = header.lines().next().unwrap_or("").trim();

    if status_line.starts_with("HTTP/1.") && status_line.contains("200") {
        Ok(())
    } else {
        Err(ProxyError::Rejected {
            status_line: status_line.to_string(),
        })
    }
}

/// Send the payload and wait for the proxy's go-ahead
async fn proxy_handshake<S>(stream: &mut S, payload: &str, timeout: Duration) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Sending payload ({} bytes)", payload.len());
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await?;

    let header = tokio::time::timeout(
        timeout,
        read_header_block(stream, MAX_PROXY_RESPONSE_BYTES),
    )
    .await
    .map_err(|_| ProxyError::Timeout("proxy response"))??;

    debug!("Proxy response:\n{}", header.trim_end());
    check_status_line(&header)
}

/// Proxy leg settings taken from a [`TunnelConfig`]
#[derive(Debug, Clone)]
pub struct ProxyDialer {
    proxy_host: String,
    proxy_port: u16,
    payload: String,
    sni: Option<String>,
    allow_insecure_tls: bool,
    timeout: Duration,
}

impl ProxyDialer {
    /// `None` when the config connects directly
    pub fn from_config(config: &TunnelConfig) -> Option<Self> {
        let proxy = config.proxy()?;
        Some(Self {
            proxy_host: proxy.host.to_string(),
            proxy_port: proxy.port,
            payload: proxy.payload.to_string(),
            sni: config.sni().map(str::to_string),
            allow_insecure_tls: config.allow_insecure_proxy_tls,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    /// Open a stream to `ssh_host:ssh_port` through the proxy
    pub async fn dial(&self, ssh_host: &str, ssh_port: u16) -> Result<BoxedStream, ProxyError> {
        let addr = self.proxy_addr();
        info!("Opening socket to proxy {}", addr);

        let tcp_stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::Timeout("proxy connect"))?
            .map_err(|source| ProxyError::Connect {
                addr: addr.clone(),
                source,
            })?;

        tcp_stream.set_nodelay(true).ok();

        let payload = render_payload(&self.payload, ssh_host, ssh_port);

        match &self.sni {
            Some(sni) => {
                info!("Wrapping proxy socket in TLS (SNI: {})", sni);
                let mut tls_stream =
                    tls::wrap(tcp_stream, sni, self.allow_insecure_tls, self.timeout).await?;
                proxy_handshake(&mut tls_stream, &payload, self.timeout).await?;
                info!("Proxy tunnel to {}:{} established over TLS", ssh_host, ssh_port);
                Ok(Box::new(tls_stream))
            }
            None => {
                let mut tcp_stream = tcp_stream;
                proxy_handshake(&mut tcp_stream, &payload, self.timeout).await?;
                info!("Proxy tunnel to {}:{} established", ssh_host, ssh_port);
                Ok(Box::new(tcp_stream))
            }
        }
    }
}
