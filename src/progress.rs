//! Per-job progress channel.
//!
//! The pipeline owns a [`ProgressReporter`] (the producer) and the transport
//! owns the matching receiver (the consumer).  Events are typed; framing them
//! for the wire is the transport's business.
//!
//! A job walks a single path:
//!
//! ```text
//! Created → Chunking → Synthesizing(1 of N) … Synthesizing(N of N) → Assembling → Done
//!    └──────────┴──────────────┴─────────────────────────┴──────────────┴──→ Failed
//! ```
//!
//! Every transition emits exactly one event.  The terminal transitions
//! ([`finish`](ProgressReporter::finish) and [`fail`](ProgressReporter::fail))
//! consume the reporter, which drops the sender and closes the channel, so
//! nothing can follow a terminal event.

use thiserror::Error;
use tokio::sync::mpsc;

/// Default number of buffered events per job.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// One message on a job's progress channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Human-readable progress note.
    Status(String),
    /// Terminal failure.
    Error(String),
    /// Terminal success: the job title and the assembled audio.
    Result { title: String, audio: Vec<u8> },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Status(_))
    }
}

/// Where a job currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Chunking,
    /// 1-based chunk index.
    Synthesizing { index: usize, total: usize },
    Assembling,
    Done,
    Failed,
}

impl Stage {
    fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Created, Chunking) => true,
            (Chunking, Synthesizing { index: 1, total }) => total >= 1,
            (Synthesizing { index, total }, Synthesizing { index: i, total: t }) => {
                t == total && i == index + 1 && i <= t
            }
            (Synthesizing { index, total }, Assembling) => index == total,
            (Assembling, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("progress consumer disconnected")]
    Disconnected,
    #[error("invalid progress transition from {from:?} to {to:?}")]
    InvalidTransition { from: Stage, to: Stage },
}

/// Producer half of a job's progress channel.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressEvent>,
    stage: Stage,
}

/// Create a progress channel buffering up to `capacity` events.
pub fn channel(capacity: usize) -> (ProgressReporter, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressReporter { tx, stage: Stage::Created }, rx)
}

impl ProgressReporter {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// `true` once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn chunking(&mut self) -> Result<(), ReportError> {
        self.advance(Stage::Chunking, "Splitting text into chunks...".to_string()).await
    }

    pub async fn synthesizing(&mut self, index: usize, total: usize) -> Result<(), ReportError> {
        let message = format!("Generating audio for chunk {index} of {total}...");
        self.advance(Stage::Synthesizing { index, total }, message).await
    }

    pub async fn assembling(&mut self) -> Result<(), ReportError> {
        let message = match self.stage {
            Stage::Synthesizing { total, .. } => format!("Combining {total} audio segments..."),
            _ => "Combining audio segments...".to_string(),
        };
        self.advance(Stage::Assembling, message).await
    }

    /// Emit the terminal `Result` event and close the channel.
    pub async fn finish(mut self, title: String, audio: Vec<u8>) -> Result<(), ReportError> {
        self.check(Stage::Done)?;
        self.stage = Stage::Done;
        self.send(ProgressEvent::Result { title, audio }).await
    }

    /// Emit the terminal `Error` event and close the channel.
    pub async fn fail(mut self, reason: impl Into<String>) -> Result<(), ReportError> {
        self.check(Stage::Failed)?;
        self.stage = Stage::Failed;
        self.send(ProgressEvent::Error(reason.into())).await
    }

    async fn advance(&mut self, next: Stage, message: String) -> Result<(), ReportError> {
        self.check(next)?;
        self.stage = next;
        self.send(ProgressEvent::Status(message)).await
    }

    fn check(&self, next: Stage) -> Result<(), ReportError> {
        if self.stage.can_advance_to(next) {
            Ok(())
        } else {
            Err(ReportError::InvalidTransition { from: self.stage, to: next })
        }
    }

    async fn send(&self, event: ProgressEvent) -> Result<(), ReportError> {
        self.tx.send(event).await.map_err(|_| ReportError::Disconnected)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_happy_path_emits_one_event_per_transition() {
        let (mut reporter, rx) = channel(32);
        reporter.chunking().await.unwrap();
        reporter.synthesizing(1, 2).await.unwrap();
        reporter.synthesizing(2, 2).await.unwrap();
        reporter.assembling().await.unwrap();
        reporter.finish("T".into(), vec![1, 2]).await.unwrap();

        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![
                ProgressEvent::Status("Splitting text into chunks...".into()),
                ProgressEvent::Status("Generating audio for chunk 1 of 2...".into()),
                ProgressEvent::Status("Generating audio for chunk 2 of 2...".into()),
                ProgressEvent::Status("Combining 2 audio segments...".into()),
                ProgressEvent::Result { title: "T".into(), audio: vec![1, 2] },
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_from_any_stage_closes_channel() {
        let (mut reporter, rx) = channel(8);
        reporter.chunking().await.unwrap();
        reporter.synthesizing(1, 3).await.unwrap();
        reporter.fail("provider exploded").await.unwrap();

        let events = drain(rx).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last(), Some(&ProgressEvent::Error("provider exploded".into())));
    }

    #[tokio::test]
    async fn test_out_of_order_transitions_are_rejected() {
        let (mut reporter, _rx) = channel(8);
        assert!(matches!(
            reporter.synthesizing(1, 1).await,
            Err(ReportError::InvalidTransition { from: Stage::Created, .. })
        ));
        reporter.chunking().await.unwrap();
        assert!(reporter.synthesizing(2, 2).await.is_err());
        reporter.synthesizing(1, 2).await.unwrap();
        assert!(reporter.assembling().await.is_err());
        assert_eq!(reporter.stage(), Stage::Synthesizing { index: 1, total: 2 });
    }

    #[tokio::test]
    async fn test_finish_requires_assembling() {
        let (mut reporter, _rx) = channel(8);
        reporter.chunking().await.unwrap();
        assert!(reporter.finish("T".into(), vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_consumer_is_reported() {
        let (mut reporter, rx) = channel(8);
        drop(rx);
        assert!(reporter.is_closed());
        assert_eq!(reporter.chunking().await, Err(ReportError::Disconnected));
    }
}
