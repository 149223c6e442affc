//! qmanager web console

use clap::Parser;
use qmanager_web::auth::Sessions;
use qmanager_web::config::ConsoleConfig;
use qmanager_web::context::AppContext;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "qmanager-web")]
#[command(about = "Browser console for QEMU images, machines and networking")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QMANAGER_CONFIG", default_value = "qmanager.toml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long, env = "QMANAGER_LISTEN")]
    listen: Option<String>,

    /// Directory holding the database
    #[arg(long, env = "QMANAGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Root directory for disk images
    #[arg(long, env = "QMANAGER_IMAGES_DIR")]
    images_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("qmanager web console v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ConsoleConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.images_dir {
        config.images_dir = dir;
    }
    std::fs::create_dir_all(&config.data_dir)?;

    let ctx = AppContext::open(config)?;
    match Sessions::new(ctx.store(), ctx.config.session_ttl_secs).purge_expired() {
        Ok(n) if n > 0 => info!(removed = n, "Purged expired sessions"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Session purge failed"),
    }
    info!(
        images = %ctx.config.images_dir.display(),
        database = %ctx.config.db_path().display(),
        "Console configured"
    );

    qmanager_web::server::serve(ctx).await
}
