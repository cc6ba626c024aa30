use anyhow::{Context, Result, bail};
use clap::Parser;
use socksgate::{ServerConfig, ServerConfigFile, Socks5Server, UserPass};
use std::{path::PathBuf, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 proxy server", long_about = None)]
struct Args {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Socket idle timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Relay buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Bind attempts before giving up
    #[arg(long)]
    bind_retries: Option<u32>,

    /// Base delay between bind attempts in seconds
    #[arg(long)]
    bind_retry_delay: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = build_config(args)?;

    // Instantiate server
    let mut server = Socks5Server::new(config);

    // Run it until Ctrl-C
    info!("Starting SOCKS5 proxy: {}", server.config().listen_addr());
    server
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            info!("interrupted");
        })
        .await
        .context("SOCKS5 proxy failed to start")?;

    Ok(())
}

/// build_config layers defaults, the optional config file and flags
fn build_config(args: Args) -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Some(path) = &args.config {
        let file = ServerConfigFile::load(path)?;
        config.apply_file(file)?;
    }

    if let Some(host) = args.listen {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    // Check for auth and grab it if present
    match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            config.credentials = Some(UserPass {
                username: u,
                password: p,
            });
        }
        (None, None) => {}
        _ => bail!("must provide both username and password (or neither)"),
    }

    if let Some(secs) = args.timeout {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    if let Some(size) = args.buffer_size {
        config.buffer_size = size;
    }
    if let Some(retries) = args.bind_retries {
        config.bind_retries = retries;
    }
    if let Some(secs) = args.bind_retry_delay {
        config.bind_retry_delay = Duration::from_secs(secs);
    }

    config.validate()?;
    Ok(config)
}
