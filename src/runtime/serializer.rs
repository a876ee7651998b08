//! Per-session update serializer
//!
//! Each session key owns a lane: an mpsc channel drained by one spawned
//! task, so jobs for the same chat run strictly one after another while
//! different chats proceed concurrently.

use crate::interpreter::InterpreterError;
use crate::session::SessionKey;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("Lane for {0} is closed")]
    LaneClosed(String),
    #[error("Job for {0} panicked")]
    JobPanicked(String),
    #[error(transparent)]
    Job(#[from] InterpreterError),
}

type JobResult = Result<(), SerializerError>;

struct Task {
    job: BoxFuture<'static, Result<(), InterpreterError>>,
    done: oneshot::Sender<JobResult>,
}

/// Completion of an enqueued job
pub struct JobHandle {
    key: SessionKey,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    /// Wait for the job to finish
    #[allow(dead_code)] // The webhook acknowledges without waiting
    pub async fn wait(self) -> JobResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(SerializerError::LaneClosed(self.key.to_string())))
    }
}

/// Lanes keyed by session; lanes live as long as the serializer
#[derive(Default)]
pub struct UpdateSerializer {
    lanes: Mutex<HashMap<SessionKey, mpsc::UnboundedSender<Task>>>,
}

impl UpdateSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` behind every earlier job for `key`.
    ///
    /// The job starts only after the previous one, including all of its
    /// awaits, has finished. Dropping the handle does not cancel the job.
    pub fn enqueue<F>(&self, key: SessionKey, job: F) -> JobHandle
    where
        F: Future<Output = Result<(), InterpreterError>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let mut task = Task {
            job: job.boxed(),
            done,
        };

        let mut lanes = self.lanes.lock().unwrap();
        if let Some(lane) = lanes.get(&key) {
            match lane.send(task) {
                Ok(()) => return JobHandle { key, rx },
                Err(mpsc::error::SendError(returned)) => {
                    tracing::warn!(session = %key, "Lane closed, respawning");
                    task = returned;
                }
            }
        }

        let lane = spawn_lane(key.clone());
        if lane.send(task).is_err() {
            tracing::error!(session = %key, "Fresh lane rejected job");
        }
        lanes.insert(key.clone(), lane);
        JobHandle { key, rx }
    }

    /// Number of lanes spawned so far
    pub fn lanes(&self) -> usize {
        self.lanes.lock().unwrap().len()
    }
}

fn spawn_lane(key: SessionKey) -> mpsc::UnboundedSender<Task> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
    tracing::debug!(session = %key, "Spawning serializer lane");

    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            let result = match AssertUnwindSafe(task.job).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    tracing::error!(session = %key, error = %e, "Update processing failed");
                    Err(SerializerError::Job(e))
                }
                Err(_) => {
                    tracing::error!(session = %key, "Update job panicked");
                    Err(SerializerError::JobPanicked(key.to_string()))
                }
            };
            // Callers may have dropped their handle
            let _ = task.done.send(result);
        }
    });

    tx
}
