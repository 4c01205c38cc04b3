//! nxsession - command-line client for NXCP management servers
//!
//! Connects, logs in, and runs one command: server info, notification
//! watching, file transfer, object listing or TCP forwarding through the
//! server.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use nxsession_client::{Config, Credentials, Session, TlsClientConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nxsession")]
#[command(about = "Command-line client for NXCP management servers")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "NXSESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Server host (overrides the configuration)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port (overrides the configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Login name
    #[arg(short, long, env = "NXSESSION_USER", default_value = "admin")]
    user: String,

    /// Password
    #[arg(long, env = "NXSESSION_PASSWORD", default_value = "")]
    password: String,

    /// Authentication token (replaces user and password)
    #[arg(short = 't', long, env = "NXSESSION_TOKEN")]
    token: Option<String>,

    /// Do not request protocol-level encryption
    #[arg(long)]
    no_encryption: bool,

    /// Reconnect automatically if the connection drops
    #[arg(long)]
    reconnect: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "NXSESSION_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "NXSESSION_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "NXSESSION_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "NXSESSION_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show server and login information
    Info,

    /// Print notifications until interrupted
    Watch {
        /// Topics to subscribe to
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,
    },

    /// Load the object tree and list it
    Objects {
        /// Only objects whose name contains this text
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Upload a local file to the server
    Upload {
        /// Local file
        local: PathBuf,

        /// Name on the server (defaults to the local file name)
        #[arg(short, long)]
        remote: Option<String>,

        /// Continue a partial upload when the server supports it
        #[arg(long)]
        resume: bool,

        /// Disable chunk compression
        #[arg(long)]
        no_compress: bool,
    },

    /// Download a server file
    Download {
        /// File name on the server
        remote: String,

        /// Destination (defaults to the remote name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download a server file and keep printing appended text
    Tail {
        /// File name on the server
        remote: String,
    },

    /// Forward a local port to an address reachable from the server
    Forward {
        /// Local address to listen on
        #[arg(short, long, default_value = "127.0.0.1:2222")]
        listen: SocketAddr,

        /// Target as ip:port, or port only together with --node
        target: String,

        /// Route through this managed node
        #[arg(long)]
        node: Option<u32>,
    },

    /// Print the SHA-256 fingerprint used to resume uploads of a local file
    Fingerprint {
        /// Local file
        path: PathBuf,
    },

    /// Print the effective configuration as YAML
    ShowConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;

    // Local commands need no server connection
    match &cli.command {
        Commands::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            return Ok(());
        }
        Commands::Fingerprint { path } => {
            return commands::fingerprint(path).await;
        }
        _ => {}
    }

    let credentials = match &cli.token {
        Some(token) => Credentials::Token(token.clone()),
        None => Credentials::password(cli.user.as_str(), cli.password.as_str()),
    };
    let session = Session::connect_with(
        config.session_config(),
        credentials,
        Some(Arc::new(commands::PromptTwoFactor)),
    )
    .await
    .map_err(|e| {
        eprintln!(
            "{} to {}:{}",
            "Connection failed".red(),
            config.connection.host,
            config.connection.port
        );
        e
    })?;
    tracing::debug!("connected: {:?}", session);

    let result = match cli.command {
        Commands::Info => commands::info(&session).await,
        Commands::Watch { topics } => commands::watch(&session, &topics).await,
        Commands::Objects { name } => commands::objects(&session, name.as_deref()).await,
        Commands::Upload {
            local,
            remote,
            resume,
            no_compress,
        } => commands::upload(&session, &local, remote, resume, no_compress).await,
        Commands::Download { remote, output } => {
            commands::download(&session, &remote, output).await
        }
        Commands::Tail { remote } => commands::tail(&session, &remote).await,
        Commands::Forward {
            listen,
            target,
            node,
        } => commands::forward(&session, listen, &target, node).await,
        Commands::Fingerprint { .. } | Commands::ShowConfig => unreachable!(), // Handled above
    };

    session.disconnect().await;
    result
}

/// Configuration file and environment, then command-line overrides.
fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if cli.no_encryption {
        config.connection.encryption = false;
    }
    if cli.reconnect {
        config.reconnect.enabled = true;
    }

    if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
        let mut tls = TlsClientConfig::new();
        tls.enabled = true;
        if let Some(path) = &cli.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        match (&cli.client_cert, &cli.client_key) {
            (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
            (None, None) => {}
            _ => return Err("--client-cert and --client-key must be used together".into()),
        }
        if cli.insecure {
            tls = tls.with_insecure();
        }
        if let Some(name) = &cli.server_name {
            tls = tls.with_server_name(name);
        }
        config.connection.tls = tls;
    }

    config.validate()?;
    Ok(config)
}
