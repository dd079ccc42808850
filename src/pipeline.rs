//! Narration pipeline — chunk, synthesize sequentially, assemble, report.
//!
//! [`Narrator::run`] drives one claimed [`Job`] to completion.  Stages never
//! overlap: each chunk is voiced only after the previous one returned, and the
//! assembler starts once every chunk has audio.  The first failing call aborts
//! the job, and the consumer sees exactly one terminal event.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    assemble::{Assembler, AssemblyError, AudioSegment},
    chunk,
    job::Job,
    progress::{ProgressReporter, ReportError},
    synth::{ProviderError, SpeechRequest, SpeechSynthesizer},
};

/// Why a job stopped before producing audio.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Text is empty.")]
    EmptyText,

    #[error("Failed to generate audio for chunk {index} of {total}: {source}")]
    Provider {
        index: usize,
        total: usize,
        #[source]
        source: ProviderError,
    },

    #[error("Failed to combine audio segments: {0}")]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// A `Result` event was emitted.
    Completed,
    /// An `Error` event was emitted.
    Failed,
    /// The consumer left; work stopped early.
    Cancelled,
}

/// Runs jobs against one synthesizer and one assembler.
pub struct Narrator {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    assembler: Arc<dyn Assembler>,
    max_chunk_chars: usize,
}

impl Narrator {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        assembler: Arc<dyn Assembler>,
        max_chunk_chars: usize,
    ) -> Self {
        Self { synthesizer, assembler, max_chunk_chars }
    }

    /// Run `job` on its own task.
    pub fn spawn(self: &Arc<Self>, job: Job, reporter: ProgressReporter) -> JoinHandle<JobOutcome> {
        let narrator = Arc::clone(self);
        tokio::spawn(async move { narrator.run(job, reporter).await })
    }

    /// Drive `job` to its terminal event.
    #[tracing::instrument(name = "narrate", skip_all, fields(job_id = %job.id))]
    pub async fn run(&self, job: Job, mut reporter: ProgressReporter) -> JobOutcome {
        match self.produce(&job, &mut reporter).await {
            Ok(audio) => {
                tracing::info!(bytes = audio.len(), "narration complete");
                match reporter.finish(job.title, audio).await {
                    Ok(()) => JobOutcome::Completed,
                    Err(e) => {
                        tracing::info!(error = %e, "consumer gone before result was delivered");
                        JobOutcome::Cancelled
                    }
                }
            }
            Err(JobError::Report(ReportError::Disconnected)) => {
                tracing::info!("progress consumer disconnected; stopping job");
                JobOutcome::Cancelled
            }
            Err(e) => {
                tracing::warn!(error = %e, "narration failed");
                if let Err(report) = reporter.fail(e.to_string()).await {
                    tracing::debug!(error = %report, "error event not delivered");
                }
                JobOutcome::Failed
            }
        }
    }

    async fn produce(&self, job: &Job, reporter: &mut ProgressReporter) -> Result<Vec<u8>, JobError> {
        reporter.chunking().await?;
        let chunks = chunk::split(&job.text, self.max_chunk_chars);
        if chunks.is_empty() {
            return Err(JobError::EmptyText);
        }

        let total = chunks.len();
        tracing::debug!(chunks = total, chars = job.text.chars().count(), "text split");

        let mut segments = Vec::with_capacity(total);
        for (i, text) in chunks.into_iter().enumerate() {
            ensure_connected(reporter)?;
            reporter.synthesizing(i + 1, total).await?;

            let request = SpeechRequest {
                text,
                voice_id: &job.voice_id,
                model_id: &job.model_id,
                style_instructions: job.style_instructions.as_deref(),
            };
            let bytes = self
                .synthesizer
                .synthesize(request)
                .await
                .map_err(|source| JobError::Provider { index: i + 1, total, source })?;

            tracing::debug!(chunk = i + 1, total, bytes = bytes.len(), "chunk synthesized");
            segments.push(AudioSegment { index: i, bytes });
        }

        ensure_connected(reporter)?;
        reporter.assembling().await?;
        Ok(self.assembler.concatenate(segments).await?)
    }
}

fn ensure_connected(reporter: &ProgressReporter) -> Result<(), JobError> {
    if reporter.is_closed() {
        Err(ReportError::Disconnected.into())
    } else {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
