//! sshtunnel - command-line host for the tunnel service
//!
//! ```text
//! sshtunnel connect --host ssh.example.com --user alice --password secret
//! sshtunnel connect --config tunnel.json --trust-key AAAAC3Nz...
//! sshtunnel hosts list
//! sshtunnel hosts forget ssh.example.com --port 22
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use sshtunnel_lib::config::{known_hosts_file, ConfigStorage};
use sshtunnel_lib::ssh::{known_hosts, ChallengeKind, HostKeyChallenge, SshTunnelEstablisher};
use sshtunnel_lib::state::{HostIdentity, RedbTrustStore, TrustStore};
use sshtunnel_lib::vpn::LoggingInterface;
use sshtunnel_lib::{TunnelConfig, TunnelEvent, TunnelService, TunnelStatus};

#[derive(Parser, Debug)]
#[command(name = "sshtunnel")]
#[command(about = "SSH tunnel through HTTP(S) payload proxies, with a local SOCKS5/HTTP forwarder")]
#[command(version)]
struct Cli {
    /// Trust store location (default: <config dir>/known_hosts.redb)
    #[arg(long, global = true)]
    known_hosts: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and keep the tunnel up until Ctrl-C
    Connect(ConnectArgs),

    /// Inspect or edit trusted host keys
    Hosts {
        #[command(subcommand)]
        action: HostsAction,
    },
}

#[derive(Subcommand, Debug)]
enum HostsAction {
    /// Print every trusted host with its key fingerprint
    List,

    /// Forget the key stored for a host
    Forget {
        host: String,

        #[arg(long, default_value_t = 22)]
        port: u16,
    },
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// JSON config file (sshHost, sshPort, sshUser, sshPass, proxyHost, ...);
    /// defaults to the saved profile
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    user: Option<String>,

    #[arg(long, env = "SSHTUNNEL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long)]
    proxy_host: Option<String>,

    #[arg(long)]
    proxy_port: Option<u16>,

    /// Payload template, e.g. "CONNECT [host_port] [protocol]\r\n\r\n"
    #[arg(long)]
    payload: Option<String>,

    /// TLS server name presented to the proxy
    #[arg(long)]
    sni: Option<String>,

    /// Local forwarder address
    #[arg(short, long)]
    listen: Option<String>,

    /// Accept any certificate from a TLS proxy
    #[arg(long)]
    insecure_proxy_tls: bool,

    /// Key string to trust for this host (printed when the host key is challenged)
    #[arg(long)]
    trust_key: Option<String>,

    /// Connect / handshake timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Save the resulting settings as the default profile
    #[arg(long)]
    save: bool,
}

impl ConnectArgs {
    async fn resolve(&self) -> Result<TunnelConfig> {
        let base = match &self.config {
            Some(path) => TunnelConfig::from_json_file(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?,
            None => ConfigStorage::new()?
                .load()
                .await
                .context("Failed to read saved profile")?
                .unwrap_or_else(|| TunnelConfig::with_password("", 22, "", "")),
        };

        let mut config = base;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.username = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if self.proxy_host.is_some() {
            config.proxy_host = self.proxy_host.clone();
        }
        if self.proxy_port.is_some() {
            config.proxy_port = self.proxy_port;
        }
        if self.payload.is_some() {
            config.payload = self.payload.clone();
        }
        if self.sni.is_some() {
            config.sni = self.sni.clone();
        }
        if let Some(listen) = &self.listen {
            config.local_forward_addr = listen.clone();
        }
        if self.insecure_proxy_tls {
            config.allow_insecure_proxy_tls = true;
        }
        if self.trust_key.is_some() {
            config.trusted_key = self.trust_key.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        Ok(config)
    }
}

fn open_trust_store(path: Option<PathBuf>) -> Result<RedbTrustStore> {
    let path = match path {
        Some(path) => path,
        None => known_hosts_file()?,
    };
    RedbTrustStore::open(&path)
        .with_context(|| format!("Failed to open trust store {}", path.display()))
}

fn print_challenge(challenge: &HostKeyChallenge) {
    match challenge.kind {
        ChallengeKind::Unknown => {
            eprintln!(
                "The authenticity of host '{}' can't be established.",
                challenge.host_identity
            );
        }
        ChallengeKind::Changed => {
            eprintln!("WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!");
            eprintln!(
                "Someone could be eavesdropping on you right now (man-in-the-middle attack)."
            );
            if let Some(previous) = &challenge.previous_fingerprint {
                eprintln!("Previously trusted key fingerprint: {}", previous);
            }
        }
    }
    eprintln!(
        "{} key fingerprint is {}.",
        challenge.key_type, challenge.fingerprint
    );
    eprintln!("If you trust this key, connect again with:");
    eprintln!("  --trust-key {}", challenge.key_string);
}

async fn connect(args: ConnectArgs, store: RedbTrustStore) -> Result<()> {
    let config = args.resolve().await?;

    if args.save {
        let storage = ConfigStorage::new()?;
        storage.save(&config).await?;
        info!("Profile saved to {}", storage.path().display());
    }

    let establisher = SshTunnelEstablisher::new(Arc::new(store));
    let (service, mut events) =
        TunnelService::new(Arc::new(establisher), Arc::new(LoggingInterface));

    service.start(config).await?;

    let mut challenged = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping tunnel");
                service.stop().await;
            }
            event = events.recv() => match event {
                Some(TunnelEvent::Status { status, message }) => {
                    println!("[{}] {}", status, message);
                    if status == TunnelStatus::Disconnected {
                        break;
                    }
                }
                Some(TunnelEvent::HostKey(challenge)) => {
                    print_challenge(&challenge);
                    challenged = true;
                    service.stop().await;
                }
                None => break,
            }
        }
    }

    if challenged {
        return Err(anyhow!("Host key not trusted"));
    }
    Ok(())
}

fn hosts(action: HostsAction, store: RedbTrustStore) -> Result<()> {
    match action {
        HostsAction::List => {
            let entries = store.entries()?;
            if entries.is_empty() {
                println!("No trusted hosts in {}", store.path().display());
            }
            for record in entries {
                let fingerprint = known_hosts::fingerprint_of_key_string(&record.key)
                    .unwrap_or_else(|| "<unreadable key>".to_string());
                println!("{}  {}", record.host_identity, fingerprint);
            }
        }
        HostsAction::Forget { host, port } => {
            let identity = HostIdentity::new(&host, port);
            if store.remove(&identity.to_string())? {
                println!("Removed {}", identity);
            } else {
                println!("{} was not trusted", identity);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    sshtunnel_lib::init_logging();

    let store = open_trust_store(cli.known_hosts)?;

    match cli.command {
        Command::Connect(args) => connect(args, store).await,
        Command::Hosts { action } => hosts(action, store),
    }
}
