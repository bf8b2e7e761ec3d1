use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cardserver::config::{load_secret_key, parse_secret_key, public_key_hex};
use cardserver::{ControlServer, Engine, Settings, TransportContext};
use clap::Parser;
use rand::rngs::OsRng;
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

#[derive(Parser, Debug)]
#[command(name = "cardserver")]
#[command(about = "peer-to-peer card dealing server", long_about = None)]
struct Args {
    /// control endpoint the local controller connects to
    #[arg(default_value = "127.0.0.1:5501", env = "CARDSERVER_CONTROL")]
    control: String,

    /// address other peers dial into
    #[arg(long, default_value = "0.0.0.0:5601", env = "CARDSERVER_LISTEN")]
    listen: String,

    /// x25519 secret key as hex
    #[arg(long, env = "CARDSERVER_SECRET_KEY", conflicts_with = "key_file")]
    secret_key: Option<String>,

    /// file holding the x25519 secret key as hex
    #[arg(long, env = "CARDSERVER_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// cut-and-choose rounds per shuffle proof
    #[arg(long, default_value_t = 40)]
    shuffle_rounds: usize,

    /// seconds to open every peer channel during init
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// seconds to wait on a shuffle round or announcement barrier
    #[arg(long, default_value_t = 60)]
    round_timeout: u64,

    /// seconds to wait on a single share or reveal request
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// seconds a peer's reveal request waits for this controller's consent
    #[arg(long, default_value_t = 10)]
    grant_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cardserver=info".into()),
        )
        .init();

    let args = Args::parse();

    let secret = match (&args.secret_key, &args.key_file) {
        (Some(hex_key), _) => parse_secret_key(hex_key)?,
        (None, Some(path)) => load_secret_key(path)?,
        (None, None) => {
            warn!("no secret key given, generated an ephemeral one");
            StaticSecret::random_from_rng(OsRng)
        }
    };
    info!(server_key = %public_key_hex(&secret), "static channel key");

    let settings = Settings {
        shuffle_rounds: args.shuffle_rounds,
        connect_timeout: Duration::from_secs(args.connect_timeout),
        round_timeout: Duration::from_secs(args.round_timeout),
        request_timeout: Duration::from_secs(args.request_timeout),
        grant_timeout: Duration::from_secs(args.grant_timeout),
    };

    let transport = TransportContext::bind(&args.listen, secret)
        .await
        .with_context(|| format!("binding peer listener on {}", args.listen))?;
    info!(listen = %transport.local_addr()?, "peer listener bound");

    let engine = Engine::new(transport, settings);
    let server = ControlServer::bind(&args.control, engine.clone()).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            engine.terminate();
        }
    }
    info!("cardserver stopped");
    Ok(())
}
