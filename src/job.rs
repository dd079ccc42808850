//! Pending narration jobs, keyed by an opaque request id.
//!
//! A job lives in the [`JobRegistry`] between submission and the moment a
//! progress stream claims it.  Claiming is destructive: [`JobRegistry::take`]
//! removes the entry under the lock, so a request id can be consumed by at
//! most one stream and two concurrent claimers can never both win.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

/// Shortest period accepted by [`JobRegistry::spawn_sweeper`].
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Job input as submitted by a client, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub title: String,
    pub text: String,
    pub voice_id: String,
    pub model_id: String,
    pub style_instructions: Option<String>,
}

/// A registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub text: String,
    pub voice_id: String,
    pub model_id: String,
    pub style_instructions: Option<String>,
}

impl Job {
    fn from_new(id: String, new: NewJob) -> Self {
        Self {
            id,
            title: new.title,
            text: new.text,
            voice_id: new.voice_id,
            model_id: new.model_id,
            style_instructions: new.style_instructions,
        }
    }
}

/// The id is unknown, or the job was already claimed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no job registered under id '{0}'")]
pub struct NotFound(pub String);

struct Entry {
    job: Job,
    submitted: Instant,
}

/// In-memory store of jobs waiting for their progress stream.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `job` and return its freshly generated id.
    pub fn put(&self, job: NewJob) -> String {
        let id = generate_id();
        let entry = Entry { job: Job::from_new(id.clone(), job), submitted: Instant::now() };
        self.jobs.lock().insert(id.clone(), entry);
        tracing::debug!(job_id = %id, "job registered");
        id
    }

    /// Remove and return the job registered under `id`.
    pub fn take(&self, id: &str) -> Result<Job, NotFound> {
        self.jobs
            .lock()
            .remove(id)
            .map(|entry| entry.job)
            .ok_or_else(|| NotFound(id.to_string()))
    }

    /// Drop jobs that were never claimed within `ttl`.  Returns how many.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, entry| entry.submitted.elapsed() < ttl);
        before - jobs.len()
    }

    /// Number of jobs waiting to be claimed.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge expired jobs every `every` until `shutdown` flips to `true`.
    ///
    /// `every` is raised to at least [`MIN_SWEEP_INTERVAL`].
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        ttl: Duration,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(MIN_SWEEP_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = registry.purge_expired(ttl);
                        if purged > 0 {
                            tracing::info!(purged, remaining = registry.len(), "dropped unclaimed jobs");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Millisecond timestamp prefix plus a random suffix.
fn generate_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{millis:x}-{}", Uuid::new_v4().simple())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
