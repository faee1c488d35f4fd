//! 🚀 vbx-cli: the front door. Load config, set up logging, hand over to `vbx::run`.
//!
//! 🎬 *[a terminal. a TOML file. a 40 GB NDJSON dump. someone types `vbx` and goes to
//! make coffee.]*

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use vbx::app_config::{FileSourceConfig, SourceConfig};

#[derive(Parser, Debug)]
#[command(name = "vbx", about = "Stream NDJSON records into a vector database, in adaptive batches")]
struct Args {
    /// 🔧 TOML config file. Without one, configuration comes from VBX_* env vars only.
    #[arg(default_value = "vbx.toml")]
    config: PathBuf,

    /// 📂 Read this NDJSON file instead of the configured source (`.gz` is decompressed).
    #[arg(long, conflicts_with = "stdin")]
    input: Option<String>,

    /// 📥 Read NDJSON from stdin instead of the configured source.
    #[arg(long)]
    stdin: bool,

    /// ⏳ Wait for vector indexing to catch up before exiting.
    #[arg(long)]
    wait_for_indexing: bool,
}

fn looks_like_a_connection_problem(cause: &str) -> bool {
    [
        "error sending request",
        "connection refused",
        "tcp connect error",
        "dns error",
        "transport error",
    ]
    .iter()
    .any(|needle| cause.to_lowercase().contains(needle))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config_file = args
        .config
        .try_exists()
        .with_context(|| {
            format!(
                "💀 could not check whether '{}' exists. If it's a relative path, try an absolute one",
                args.config.display()
            )
        })?
        .then_some(args.config.as_path());

    let mut app_config = vbx::load_config(config_file)
        .context("💀 could not load the configuration, check the file and any VBX_* variables")?;
    if let Some(input) = args.input {
        app_config.source = SourceConfig::File(FileSourceConfig::new(input));
    } else if args.stdin {
        app_config.source = SourceConfig::Stdin;
    }
    if args.wait_for_indexing {
        app_config.readiness.enabled = true;
    }

    match vbx::run(app_config).await {
        Ok(summary) => {
            println!("{summary}");
            if summary.has_failures() {
                error!(
                    "⚠️ {} records failed for good, see the log above for why",
                    summary.errors
                );
                std::process::exit(2);
            }
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            let mut connection_trouble = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                connection_trouble |= looks_like_a_connection_problem(&cause.to_string());
            }
            if connection_trouble {
                error!(
                    "🔧 hint: the server doesn't look reachable. Check that it is running and that \
                     connection.grpc_url and connection.rest_url point at it."
                );
            }
            std::process::exit(1);
        }
    }
}
