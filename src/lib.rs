//! # narrate
//!
//! Long-form narration: turn an arbitrarily long text into one audio file by
//! voicing it chunk by chunk through a speech provider and joining the
//! segments without re-encoding.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use narrate::{config::Settings, job::{JobRegistry, NewJob}, progress};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = Settings::default();
//! let narrator = Arc::new(settings.build_narrator()?);
//! let registry = JobRegistry::new();
//!
//! let id = registry.put(NewJob {
//!     title: "Chapter 1".into(),
//!     text: "Call me Ishmael. Some years ago…".into(),
//!     voice_id: "alloy".into(),
//!     model_id: "gpt-4o-mini-tts".into(),
//!     style_instructions: Some("Slow and warm.".into()),
//! });
//!
//! let (reporter, mut events) = progress::channel(16);
//! narrator.spawn(registry.take(&id)?, reporter);
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//! 1. **Chunking** — text split into ≤ 4 000-char pieces, preferring sentence ends.
//! 2. **Synthesis** — one provider call per chunk, strictly in order.
//! 3. **Assembly** — segments joined with `ffmpeg -c copy` (or in process for WAV).
//! 4. **Report** — status events along the way, then the audio or an error.

pub mod assemble;
pub mod chunk;
pub mod config;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod synth;

// HTTP transport: submit + SSE progress stream.
#[cfg(feature = "server")]
pub mod http;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use assemble::{Assembler, AudioSegment, FfmpegConcat, WavJoin};
pub use job::{Job, JobRegistry, NewJob};
pub use pipeline::{JobOutcome, Narrator};
pub use progress::{ProgressEvent, ProgressReporter};
pub use synth::{OpenAiSpeech, SpeechSynthesizer};
