use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use hoard::config::{self, Bootstrap};
use hoard::logging;
use hoard::server;

#[derive(Parser, Debug)]
#[command(name = "hoard", about = "Caching reverse proxy that keeps static assets on disk", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Address to listen on
    #[arg(long, env = "HOARD_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "HOARD_PORT")]
    port: Option<u16>,

    /// Origin URL, e.g. https://assets.example.com
    #[arg(long, env = "HOARD_BACKEND")]
    backend: Option<String>,

    /// Cache root directory
    #[arg(long = "cache-dir", env = "HOARD_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Regex over the request path selecting cacheable resources
    #[arg(long, env = "HOARD_PATTERN")]
    pattern: Option<String>,
}

impl Cli {
    fn apply(&self, cfg: &mut Bootstrap) {
        if let Some(host) = &self.host {
            cfg.server.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(backend) = &self.backend {
            cfg.upstream.backend = backend.clone();
        }
        if let Some(dir) = &self.cache_dir {
            cfg.cache.dir = dir.clone();
        }
        if let Some(pattern) = &self.pattern {
            cfg.cache.pattern = pattern.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = match &cli.config {
        Some(path) => config::load(path)?,
        None => (Bootstrap::default(), Vec::new()),
    };
    cli.apply(&mut cfg);

    logging::init(&cfg.logger, cli.verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    cfg.validate()?;

    match &cli.config {
        Some(path) => log::info!("hoard starting with config {}", path.display()),
        None => log::info!("hoard starting without a config file"),
    }

    server::run(cfg).await
}
