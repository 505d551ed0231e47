use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use kontrol::{Kontrol, KontrolConfig, MemoryStorage, Storage};

/// The kite registry and authentication service.
#[derive(Parser)]
#[command(name = "kontrol", version)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 4000, env = "KONTROL_PORT")]
    port: u16,

    /// Kontrol's username; the issuer of every token.
    #[arg(long, default_value = "kontrol", env = "KONTROL_USERNAME")]
    username: String,

    /// Environment this kontrol serves.
    #[arg(long, default_value = "production")]
    environment: String,

    #[arg(long, default_value = "unconfigured")]
    region: String,

    /// Public URL kites should reach kontrol under; derived from the
    /// bound address when omitted.
    #[arg(long, env = "KONTROL_URL")]
    url: Option<String>,

    /// RSA public key (PEM).
    #[arg(long, env = "KONTROL_PUBLIC_KEY_FILE")]
    public_key_file: PathBuf,

    /// RSA private key (PEM).
    #[arg(long, env = "KONTROL_PRIVATE_KEY_FILE")]
    private_key_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kite::init_logging();
    let cli = Cli::parse();

    let public_key = std::fs::read_to_string(&cli.public_key_file)
        .with_context(|| format!("reading {}", cli.public_key_file.display()))?;
    let private_key = std::fs::read_to_string(&cli.private_key_file)
        .with_context(|| format!("reading {}", cli.private_key_file.display()))?;

    let storage: Arc<dyn Storage> = match std::env::var("KONTROL_STORAGE").as_deref() {
        Ok("") | Ok("memory") | Err(_) => Arc::new(MemoryStorage::new()),
        Ok(other) => {
            anyhow::bail!("storage driver {other:?} is not built into this binary")
        }
    };

    let mut config = KontrolConfig::new(public_key, private_key);
    config.ip = cli.ip;
    config.port = cli.port;
    config.username = cli.username;
    config.environment = cli.environment;
    config.region = cli.region;
    config.url = cli.url;

    let kontrol = Kontrol::new(config, storage)?;
    tracing::info!(port = cli.port, "kontrol starting");
    kontrol.serve().await
}
