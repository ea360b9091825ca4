//! rntbd - probe client for RNTBD replica endpoints
//!
//! Opens a channel to one replica, negotiates, and optionally issues a read.

use clap::{Parser, Subcommand};
use rntbd_client::{Channel, ClientError, TransportConfig};
use rntbd_protocol::{OperationType, RequestFrame, RequestToken, ResourceType};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rntbd")]
#[command(about = "Probe client for RNTBD replica endpoints")]
#[command(version)]
struct Cli {
    /// Replica address, e.g. rntbd://host:port/apps/.../replicas/...
    #[arg(short, long, env = "RNTBD_TARGET")]
    target: String,

    /// User agent sent during negotiation
    #[arg(long, env = "RNTBD_USER_AGENT")]
    user_agent: Option<String>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "RNTBD_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "RNTBD_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the target host)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and negotiate, then print the server properties
    Negotiate,

    /// Read one resource
    Read {
        /// Replica path; defaults to the path of the target address
        #[arg(short, long)]
        replica_path: Option<String>,

        /// Numeric resource type (3 = document)
        #[arg(short = 'T', long, default_value = "3")]
        resource_type: u16,

        /// Authorization token
        #[arg(short, long, env = "RNTBD_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration (from file if RNTBD_CONFIG is set, then env overrides)
    let mut config = match TransportConfig::load() {
        Ok(c) => c,
        Err(e) => {
            if std::env::var("RNTBD_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            TransportConfig::default()
        }
    };

    if cli.tls || cli.ca_cert.is_some() || cli.insecure {
        config.tls.enabled = true;
        if let Some(ref path) = cli.ca_cert {
            config.tls.ca_cert_path = Some(path.clone());
        }
        config.tls.insecure = cli.insecure;
        if cli.server_name.is_some() {
            config.tls.server_name = cli.server_name.clone();
        }
    }
    if let Some(ref user_agent) = cli.user_agent {
        config.user_agent = Some(user_agent.clone());
    }
    config.validate()?;

    let channel = Channel::new(&cli.target, config.connection_config(), None, None)?;
    let result = run(&channel, &cli).await;
    if let Err(e) = channel.close().await {
        tracing::debug!("Closing channel: {}", e);
    }

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(channel: &Channel, cli: &Cli) -> Result<(), ClientError> {
    let activity_id = Uuid::new_v4();
    tracing::info!("Opening channel to {} (activity {})", cli.target, activity_id);
    channel.open(activity_id).await?;

    match &cli.command {
        Commands::Negotiate => {
            if let Some(properties) = channel.server_properties() {
                let output = serde_json::json!({
                    "target": cli.target,
                    "connection": channel.dispatcher().connection().name(),
                    "server_agent": properties.agent,
                    "server_version": properties.version,
                    "idle_timeout_secs": properties.idle_timeout.map(|t| t.as_secs()),
                });
                println!("{}", pretty(&output));
            }
        }
        Commands::Read {
            replica_path,
            resource_type,
            auth_token,
        } => {
            let resource_type = ResourceType::try_from(*resource_type)?;
            let activity_id = Uuid::new_v4();
            let mut request = RequestFrame::new(resource_type, OperationType::Read, activity_id);
            if let Some(path) = replica_path {
                request
                    .tokens
                    .set_string(RequestToken::ReplicaPath, path.as_str())?;
            }
            if let Some(token) = auth_token {
                request
                    .tokens
                    .set_string(RequestToken::AuthorizationToken, token.as_str())?;
            }
            request.set_date(chrono::Utc::now())?;

            let response = channel.request(request, &cli.target, activity_id).await?;
            let body = response
                .body
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned());
            let output = serde_json::json!({
                "status": response.status,
                "activity_id": response.activity_id.to_string(),
                "lsn": response.lsn,
                "request_charge": response.request_charge,
                "session_token": response.session_token,
                "headers": response.headers,
                "body": body,
            });
            println!("{}", pretty(&output));
        }
    }
    Ok(())
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
