//! Engine worker
//!
//! The adapter and its engine live on one dedicated thread. Connection
//! handlers submit jobs through a queue and block on a per-job reply
//! channel, so at most one engine call is in flight at any time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::adapter::{RequestCounter, TranslationAdapter};
use super::engine::EngineError;

/// Work accepted by the engine worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationRequest {
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationResponse {
    Single(String),
    Batch(Vec<String>),
}

struct Job {
    request: TranslationRequest,
    reply: Sender<Result<TranslationResponse, EngineError>>,
}

/// Owner of the worker thread
pub struct EngineWorker {
    sender: Sender<Job>,
    thread: JoinHandle<u64>,
}

impl EngineWorker {
    /// Move `adapter` onto a new worker thread. Sentence ids come from
    /// `counter`, which the caller keeps.
    pub fn spawn(adapter: TranslationAdapter, counter: Arc<RequestCounter>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("engine-worker".to_string())
            .spawn(move || run_worker(adapter, counter, receiver))?;

        Ok(Self { sender, thread })
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle { sender: self.sender.clone() }
    }

    /// Stop accepting jobs and wait for the worker to drain the queue.
    /// Returns the number of jobs it ran. Outstanding handles keep the
    /// worker alive until they are dropped.
    pub fn shutdown(self) -> u64 {
        drop(self.sender);
        match self.thread.join() {
            Ok(jobs) => jobs,
            Err(_) => {
                log::error!("Engine worker panicked");
                0
            }
        }
    }
}

/// Cloneable submission side of the worker queue
#[derive(Clone)]
pub struct WorkerHandle {
    sender: Sender<Job>,
}

impl WorkerHandle {
    /// Submit a request and block until the engine answers
    pub fn submit(&self, request: TranslationRequest) -> Result<TranslationResponse, EngineError> {
        let (reply, response) = mpsc::channel();
        self.sender
            .send(Job { request, reply })
            .map_err(|_| EngineError::WorkerGone)?;
        response.recv().map_err(|_| EngineError::WorkerGone)?
    }
}

fn run_worker(
    mut adapter: TranslationAdapter,
    counter: Arc<RequestCounter>,
    jobs: Receiver<Job>,
) -> u64 {
    log::debug!("Engine worker started ({})", adapter.engine_name());
    let mut processed = 0u64;

    for job in jobs {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match &job.request {
            TranslationRequest::Single(source) => adapter
                .translate_one(source, &counter)
                .map(TranslationResponse::Single),
            TranslationRequest::Batch(sources) => adapter
                .translate_batch(sources, &counter)
                .map(TranslationResponse::Batch),
        }))
        .unwrap_or_else(|_| Err(EngineError::Failed("engine panicked".to_string())));

        processed += 1;
        // The submitter may have gone away; nothing to do then
        let _ = job.reply.send(result);
    }

    log::debug!("Engine worker stopped after {} job(s)", processed);
    processed
}
