//! Narration server — submit text, stream progress, receive the audio.
//!
//! Usage:
//!   narrate-server
//!   narrate-server --config narrate.json --bind 0.0.0.0:3000
//!   OPENAI_API_KEY=sk-… narrate-server --response-format wav --assembler wav
//!
//! Requirements:
//!   - ffmpeg on $PATH (or `--ffmpeg`) unless the WAV assembler is selected

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use narrate::{
    config::{AssemblerKind, Settings},
    http::{router, shutdown_signal, AppState},
    synth::AudioFormat,
};

#[derive(Debug, Parser)]
#[command(name = "narrate-server", version, about = "Chunked text-to-speech narration server")]
struct Cli {
    /// JSON settings file; flags below override it.
    #[arg(long, env = "NARRATE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "NARRATE_BIND")]
    bind: Option<SocketAddr>,

    /// OpenAI-compatible API root, e.g. https://api.openai.com/v1
    #[arg(long, env = "NARRATE_API_BASE_URL")]
    api_base_url: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, value_parser = clap::value_parser!(AudioFormat))]
    response_format: Option<AudioFormat>,

    #[arg(long, value_enum)]
    assembler: Option<AssemblerArg>,

    #[arg(long, env = "NARRATE_FFMPEG")]
    ffmpeg: Option<PathBuf>,

    #[arg(long)]
    max_chunk_chars: Option<usize>,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum AssemblerArg {
    Ffmpeg,
    Wav,
}

impl Cli {
    fn settings(self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };

        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
        if let Some(url) = self.api_base_url {
            settings.api_base_url = url;
        }
        if self.api_key.is_some() {
            settings.api_key = self.api_key;
        }
        if let Some(format) = self.response_format {
            settings.response_format = format;
        }
        if let Some(kind) = self.assembler {
            settings.assembler = match kind {
                AssemblerArg::Ffmpeg => AssemblerKind::Ffmpeg,
                AssemblerArg::Wav => AssemblerKind::Wav,
            };
        }
        if let Some(ffmpeg) = self.ffmpeg {
            settings.ffmpeg_path = ffmpeg;
        }
        if let Some(max) = self.max_chunk_chars {
            settings.max_chunk_chars = max;
        }
        settings.log_json |= self.log_json;

        settings.validate()?;
        Ok(settings)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("narrate=info,narrate_server=info,tower_http=info"));

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Cli::parse().settings()?;
    init_tracing(settings.log_json);

    tracing::info!("Starting narrate-server v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(?settings, "configuration loaded");
    if settings.api_key.is_none() {
        tracing::warn!("no API key configured; provider requests are sent unauthenticated");
    }

    let state = AppState::from_settings(&settings)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = state.registry.spawn_sweeper(
        settings.job_ttl(),
        Duration::from_secs(60).min(settings.job_ttl()),
        stop_rx,
    );

    let registry = Arc::clone(&state.registry);
    let listener = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("Cannot bind {}", settings.bind))?;
    tracing::info!("Listening on {}", settings.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    let _ = stop_tx.send(true);
    let _ = sweeper.await;
    tracing::info!(abandoned = registry.len(), "Server shutdown complete");
    Ok(())
}
