//! Tunnel Configuration
//!
//! One `TunnelConfig` describes one connection attempt. The serialized form uses the
//! same keys the UI layer sends (`sshHost`, `proxyHost`, `trustedKey`, ...), so a config
//! map can be passed through unchanged.

use serde::{Deserialize, Serialize};

/// Default local forwarder address (the egress point for the virtual interface)
pub const DEFAULT_LOCAL_FORWARD_ADDR: &str = "127.0.0.1:1080";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is missing")]
    MissingField(&'static str),

    #[error("Incomplete proxy settings: proxyHost, proxyPort and payload must be set together (missing {0})")]
    IncompleteProxy(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to determine config directory")]
    NoConfigDir,
}

/// Connection configuration for a single tunnel attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Remote SSH host
    #[serde(rename = "sshHost", default)]
    pub host: String,

    /// Remote SSH port (default: 22)
    #[serde(rename = "sshPort", default = "default_port", deserialize_with = "port_or_default")]
    pub port: u16,

    /// SSH username
    #[serde(rename = "sshUser", default)]
    pub username: String,

    /// SSH password
    #[serde(rename = "sshPass", default)]
    pub password: String,

    /// HTTP(S) proxy host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_host: Option<String>,

    /// HTTP(S) proxy port
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_port"
    )]
    pub proxy_port: Option<u16>,

    /// Payload template sent to the proxy (`[host_port]`, `[ssh_host]`, `[ssh_port]`, `[protocol]`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Server name placed in the TLS ClientHello; enables TLS wrapping of the proxy socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    /// Key string the user explicitly approved after a host key challenge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_key: Option<String>,

    /// Connect / handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Local forwarder bind address
    #[serde(default = "default_local_forward_addr")]
    pub local_forward_addr: String,

    /// Accept any certificate from the TLS proxy.
    ///
    /// The proxy is not the trust boundary (the SSH host key is), and SNI spoofing
    /// usually presents a name the proxy certificate does not cover. This has to be
    /// switched on explicitly.
    #[serde(default)]
    pub allow_insecure_proxy_tls: bool,
}

/// Borrowed view of a complete proxy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub payload: &'a str,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_local_forward_addr() -> String {
    DEFAULT_LOCAL_FORWARD_ADDR.to_string()
}

/// Ports arrive as numbers or as strings (form fields); blank means unset
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

fn optional_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<PortValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortValue::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {:?}", text))),
    }
}

fn port_or_default<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(optional_port(deserializer)?.unwrap_or_else(default_port))
}

/// Treat empty strings the same as absent values
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl TunnelConfig {
    /// Create a direct (no proxy) config with password authentication
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Route the SSH transport through an HTTP(S) proxy
    pub fn via_proxy(
        mut self,
        proxy_host: impl Into<String>,
        proxy_port: u16,
        payload: impl Into<String>,
    ) -> Self {
        self.proxy_host = Some(proxy_host.into());
        self.proxy_port = Some(proxy_port);
        self.payload = Some(payload.into());
        self
    }

    /// Wrap the proxy socket in TLS with the given server name
    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    /// Carry the user's explicit trust decision into the next attempt
    pub fn with_trusted_key(mut self, key_string: impl Into<String>) -> Self {
        self.trusted_key = Some(key_string.into());
        self
    }

    /// Check the config invariants before any I/O happens
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("SSH host"));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingField("Username"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::MissingField("Password"));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sshPort",
                reason: "port must be between 1 and 65535".to_string(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeoutSecs",
                reason: "timeout must be at least one second".to_string(),
            });
        }
        if self.local_forward_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "localForwardAddr",
                reason: format!("'{}' is not a socket address", self.local_forward_addr),
            });
        }

        let host = present(&self.proxy_host);
        let port = self.proxy_port.filter(|p| *p != 0);
        let payload = present(&self.payload);
        match (host, port, payload) {
            (None, None, None) | (Some(_), Some(_), Some(_)) => {}
            (None, _, _) => return Err(ConfigError::IncompleteProxy("proxyHost")),
            (_, None, _) => return Err(ConfigError::IncompleteProxy("proxyPort")),
            (_, _, None) => return Err(ConfigError::IncompleteProxy("payload")),
        }

        if let Some(sni) = &self.sni {
            if !sni.trim().is_empty() && host.is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "sni",
                    reason: "SNI only applies to proxied connections".to_string(),
                });
            }
            if sni.trim().parse::<std::net::IpAddr>().is_ok() {
                return Err(ConfigError::InvalidValue {
                    field: "sni",
                    reason: format!("'{}' is an IP address, SNI must be a host name", sni.trim()),
                });
            }
        }

        Ok(())
    }

    /// Proxy settings, if all of host/port/payload are set
    pub fn proxy(&self) -> Option<ProxyTarget<'_>> {
        match (present(&self.proxy_host), self.proxy_port, present(&self.payload)) {
            (Some(host), Some(port), Some(payload)) if port != 0 => Some(ProxyTarget {
                host,
                port,
                payload,
            }),
            _ => None,
        }
    }

    /// SNI override, ignoring blank values
    pub fn sni(&self) -> Option<&str> {
        present(&self.sni)
    }

    /// User-approved key string, ignoring blank values
    pub fn trusted_key(&self) -> Option<&str> {
        present(&self.trusted_key)
    }

    /// `host:port` of the SSH server
    pub fn ssh_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read a config from a JSON file
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: String::new(),
            proxy_host: None,
            proxy_port: None,
            payload: None,
            sni: None,
            trusted_key: None,
            timeout_secs: 30,
            local_forward_addr: DEFAULT_LOCAL_FORWARD_ADDR.to_string(),
            allow_insecure_proxy_tls: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_fields() {
        let config = TunnelConfig::with_password("", 22, "user", "pass");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("SSH host"))
        ));

        let config = TunnelConfig::with_password("example.com", 22, "", "pass");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("Username"))
        ));

        let config = TunnelConfig::with_password("example.com", 22, "user", "");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("Password"))
        ));
    }

    #[test]
    fn test_proxy_all_or_nothing() {
        let direct = TunnelConfig::with_password("example.com", 22, "user", "pass");
        assert!(direct.validate().is_ok());
        assert!(direct.proxy().is_none());

        let proxied = direct
            .clone()
            .via_proxy("proxy.local", 8080, "CONNECT [host_port] [protocol]\r\n\r\n");
        assert!(proxied.validate().is_ok());
        let proxy = proxied.proxy().unwrap();
        assert_eq!(proxy.host, "proxy.local");
        assert_eq!(proxy.port, 8080);

        let mut partial = direct.clone();
        partial.proxy_host = Some("proxy.local".into());
        partial.proxy_port = Some(8080);
        assert!(matches!(
            partial.validate(),
            Err(ConfigError::IncompleteProxy("payload"))
        ));

        let mut blank_payload = proxied.clone();
        blank_payload.payload = Some("   ".into());
        assert!(matches!(
            blank_payload.validate(),
            Err(ConfigError::IncompleteProxy("payload"))
        ));

        let mut no_host = proxied;
        no_host.proxy_host = None;
        assert!(matches!(
            no_host.validate(),
            Err(ConfigError::IncompleteProxy("proxyHost"))
        ));
    }

    #[test]
    fn test_sni_requires_proxy() {
        let config = TunnelConfig::with_password("example.com", 22, "user", "pass")
            .with_sni("cdn.example.net");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "sni", .. })
        ));
    }

    #[test]
    fn test_sni_must_be_host_name() {
        let proxied = TunnelConfig::with_password("example.com", 22, "user", "pass")
            .via_proxy("proxy.example.com", 8080, "CONNECT [host_port] [protocol]\\r\\n\\r\\n");

        assert!(proxied.clone().with_sni("bug.example.net").validate().is_ok());
        for literal in ["10.0.0.1", " 10.0.0.1 ", "2001:db8::1"] {
            assert!(matches!(
                proxied.clone().with_sni(literal).validate(),
                Err(ConfigError::InvalidValue { field: "sni", .. })
            ));
        }
    }

    #[test]
    fn test_wire_keys() {
        let json = r#"{
            "sshHost": "ssh.example.com",
            "sshPort": 443,
            "sshUser": "alice",
            "sshPass": "secret",
            "proxyHost": "10.0.0.1",
            "proxyPort": 80,
            "payload": "GET / HTTP/1.1\\r\\nHost: [ssh_host]\\r\\n\\r\\n",
            "sni": "bug.example.net",
            "trustedKey": "AAAAC3NzaC1lZDI1NTE5"
        }"#;
        let config: TunnelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.host, "ssh.example.com");
        assert_eq!(config.port, 443);
        assert_eq!(config.username, "alice");
        assert_eq!(config.proxy_port, Some(80));
        assert_eq!(config.sni(), Some("bug.example.net"));
        assert_eq!(config.trusted_key(), Some("AAAAC3NzaC1lZDI1NTE5"));
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.local_forward_addr, DEFAULT_LOCAL_FORWARD_ADDR);
        assert!(!config.allow_insecure_proxy_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_port() {
        let config: TunnelConfig =
            serde_json::from_str(r#"{"sshHost":"h","sshUser":"u","sshPass":"p"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.ssh_addr(), "h:22");
    }

    #[test]
    fn test_ports_as_strings() {
        let json = r#"{"sshHost":"h","sshPort":"2222","sshUser":"u","sshPass":"p","proxyPort":""}"#;
        let config: TunnelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.proxy_port, None);

        let config: TunnelConfig =
            serde_json::from_str(r#"{"sshHost":"h","sshPort":" ","proxyPort":"8080"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.proxy_port, Some(8080));

        assert!(serde_json::from_str::<TunnelConfig>(r#"{"sshPort":"ssh"}"#).is_err());
    }
}
