//! Service configuration.
//!
//! [`Settings`] is read from an optional JSON file where every field has a
//! default, so `{}` is a valid config.  The server binary then applies its
//! command-line / environment overrides on top.
//!
//! ```json
//! {
//!   "bind": "0.0.0.0:3000",
//!   "response_format": "mp3",
//!   "assembler": "ffmpeg",
//!   "ffmpeg_path": "/usr/bin/ffmpeg",
//!   "max_chunk_chars": 4000,
//!   "default_model": "gpt-4o-mini-tts"
//! }
//! ```

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::{
    assemble::{Assembler, FfmpegConcat, WavJoin},
    chunk::DEFAULT_MAX_CHUNK_CHARS,
    pipeline::Narrator,
    progress::DEFAULT_CHANNEL_CAPACITY,
    synth::{AudioFormat, OpenAiSpeech, DEFAULT_API_BASE_URL, DEFAULT_STYLE_MODEL_PATTERN},
};

/// Which [`Assembler`] joins the segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblerKind {
    /// External `ffmpeg` concat demuxer, any container.
    #[default]
    Ffmpeg,
    /// In-process join, WAV only.
    Wav,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listen address of the HTTP server.
    pub bind: SocketAddr,
    /// Root of the OpenAI-compatible API (without `/audio/speech`).
    pub api_base_url: String,
    pub api_key: Option<String>,
    /// Container requested from the provider for every chunk.
    pub response_format: AudioFormat,
    pub assembler: AssemblerKind,
    pub ffmpeg_path: PathBuf,
    pub max_chunk_chars: usize,
    /// Models matching this regex receive style instructions.
    pub style_model_pattern: String,
    /// Used when a submission leaves `voiceId` blank.
    pub default_voice: String,
    /// Used when a submission leaves `modelId` blank.
    pub default_model: String,
    pub request_timeout_secs: u64,
    /// Unclaimed jobs older than this are dropped.
    pub job_ttl_secs: u64,
    pub channel_capacity: usize,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            response_format: AudioFormat::Mp3,
            assembler: AssemblerKind::Ffmpeg,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            style_model_pattern: DEFAULT_STYLE_MODEL_PATTERN.to_string(),
            default_voice: "alloy".to_string(),
            default_model: "gpt-4o-mini-tts".to_string(),
            request_timeout_secs: 120,
            job_ttl_secs: 600,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            log_json: false,
        }
    }
}

// api_key stays out of logs.
impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("bind", &self.bind)
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("response_format", &self.response_format)
            .field("assembler", &self.assembler)
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("max_chunk_chars", &self.max_chunk_chars)
            .field("style_model_pattern", &self.style_model_pattern)
            .field("default_voice", &self.default_voice)
            .field("default_model", &self.default_model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("job_ttl_secs", &self.job_ttl_secs)
            .field("channel_capacity", &self.channel_capacity)
            .field("log_json", &self.log_json)
            .finish()
    }
}

impl Settings {
    /// Load settings from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Cannot read config: {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_chars == 0 {
            bail!("max_chunk_chars must be at least 1");
        }
        if self.job_ttl_secs == 0 {
            bail!("job_ttl_secs must be at least 1");
        }
        if self.assembler == AssemblerKind::Wav && self.response_format != AudioFormat::Wav {
            bail!(
                "the wav assembler needs response_format \"wav\", got \"{}\"",
                self.response_format
            );
        }
        self.style_models()?;
        Ok(())
    }

    pub fn style_models(&self) -> Result<Regex> {
        Regex::new(&self.style_model_pattern)
            .with_context(|| format!("Invalid style_model_pattern '{}'", self.style_model_pattern))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn build_synthesizer(&self) -> Result<OpenAiSpeech> {
        let client = OpenAiSpeech::new(&self.api_base_url, self.api_key.clone(), self.request_timeout())
            .context("Failed to build speech client")?;
        Ok(client.with_format(self.response_format).with_style_models(self.style_models()?))
    }

    pub fn build_assembler(&self) -> Arc<dyn Assembler> {
        match self.assembler {
            AssemblerKind::Ffmpeg => Arc::new(FfmpegConcat::new(&self.ffmpeg_path, self.response_format)),
            AssemblerKind::Wav => Arc::new(WavJoin),
        }
    }

    /// Wire the configured synthesizer and assembler into a [`Narrator`].
    pub fn build_narrator(&self) -> Result<Narrator> {
        self.validate()?;
        Ok(Narrator::new(
            Arc::new(self.build_synthesizer()?),
            self.build_assembler(),
            self.max_chunk_chars,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
