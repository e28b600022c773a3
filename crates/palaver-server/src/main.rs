//! Palaver chat and call-signaling server.
//!
//! Listens on one TCP port. Clients log in with a text command, chat over
//! text lines, push files and audio clips as binary frames, and exchange
//! call-signaling messages relayed through the server.

use anyhow::{Context, Result};
use clap::Parser;
use palaver_core::storage::Database;
use palaver_core::{Server, ServerConfig, ServerContext};
use tracing_subscriber::EnvFilter;

/// Palaver - TCP chat, file drop and call signaling
#[derive(Parser)]
#[command(name = "palaver-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = palaver_core::config::DEFAULT_LISTEN)]
    listen: String,

    /// Data directory (database and uploads)
    #[arg(short, long, default_value = "~/.palaver")]
    data_dir: String,

    /// Largest accepted file transfer, in MiB
    #[arg(long, default_value = "25")]
    max_file_mb: u64,

    /// Longest accepted audio clip, in seconds
    #[arg(long, default_value = "30")]
    max_audio_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let data_dir = shellexpand::tilde(&self.data_dir).to_string();
        let mut config = ServerConfig::with_data_dir(data_dir);
        config.listen = self.listen.clone();
        config.max_file_bytes = self.max_file_mb.saturating_mul(1024 * 1024);
        config.set_max_audio_ms(self.max_audio_secs.saturating_mul(1000));
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = args.config();

    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    std::fs::create_dir_all(&config.upload_dir)
        .with_context(|| format!("creating upload directory {}", config.upload_dir.display()))?;

    tracing::info!(
        version = palaver_core::VERSION,
        listen = %config.listen,
        db = %config.db_path.display(),
        uploads = %config.upload_dir.display(),
        max_file_bytes = config.max_file_bytes,
        max_audio_ms = config.max_audio_ms,
        "Starting palaver server"
    );

    let server = Server::bind(ServerContext::with_database(config, db))
        .await
        .context("binding listener")?;

    tokio::select! {
        result = server.run() => result.context("accept loop failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    Ok(())
}
