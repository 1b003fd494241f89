//! In-order execution stream.
//!
//! Work submitted to a [`Stream`] runs on one dedicated worker thread in
//! submission order; [`Stream::submit`] only queues it. The first failure is
//! kept on the stream: queued work after it is skipped and the error is
//! handed back by the next [`Stream::synchronize`].

use crate::error::ConvError;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() -> Result<(), ConvError> + Send + 'static>;

enum Command {
    Run { seq: u64, label: &'static str, job: Job },
    Barrier(Sender<()>),
}

#[derive(Default)]
struct StreamState {
    error: Mutex<Option<ConvError>>,
    completed: AtomicU64,
}

static NEXT_STREAM_ID: AtomicUsize = AtomicUsize::new(0);

/// An ordered queue of device work.
pub struct Stream {
    id: usize,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    next_seq: AtomicU64,
    state: Arc<StreamState>,
}

impl Stream {
    /// Spawns the worker thread.
    ///
    /// # Errors
    /// [`ConvError::Stream`] if the thread cannot be spawned.
    pub fn new() -> Result<Self, ConvError> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Command>();
        let state = Arc::new(StreamState::default());
        let worker_state = Arc::clone(&state);
        let worker = std::thread::Builder::new()
            .name(format!("dwconv-stream-{id}"))
            .spawn(move || {
                for cmd in receiver {
                    match cmd {
                        Command::Run { seq, label, job } => run_job(&worker_state, id, seq, label, job),
                        Command::Barrier(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| ConvError::Stream(format!("cannot spawn stream worker: {e}")))?;
        Ok(Self {
            id,
            sender: Some(sender),
            worker: Some(worker),
            next_seq: AtomicU64::new(0),
            state,
        })
    }

    /// Stream identity.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Queues `job` and returns its sequence number (0, 1, 2, ...).
    ///
    /// # Errors
    /// [`ConvError::Stream`] if the worker has exited.
    pub fn submit<F>(&self, label: &'static str, job: F) -> Result<u64, ConvError>
    where
        F: FnOnce() -> Result<(), ConvError> + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.sender()?
            .send(Command::Run {
                seq,
                label,
                job: Box::new(job),
            })
            .map_err(|_| ConvError::Stream(format!("stream {} worker has exited", self.id)))?;
        Ok(seq)
    }

    /// Blocks until everything queued so far has run.
    ///
    /// # Errors
    /// The first error raised by queued work since the last synchronize.
    pub fn synchronize(&self) -> Result<(), ConvError> {
        let (done, wait) = mpsc::channel();
        self.sender()?
            .send(Command::Barrier(done))
            .map_err(|_| ConvError::Stream(format!("stream {} worker has exited", self.id)))?;
        wait.recv()
            .map_err(|_| ConvError::Stream(format!("stream {} worker has exited", self.id)))?;
        match self.state.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of jobs that have finished (run or skipped).
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.state.completed.load(Ordering::Acquire)
    }

    fn sender(&self) -> Result<&Sender<Command>, ConvError> {
        self.sender
            .as_ref()
            .ok_or_else(|| ConvError::Stream(format!("stream {} is shut down", self.id)))
    }
}

fn run_job(state: &StreamState, stream: usize, seq: u64, label: &'static str, job: Job) {
    if state.error.lock().is_some() {
        tracing::trace!(stream, seq, label, "skipped after earlier failure");
    } else {
        let outcome = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ConvError::Stream(format!("{label} panicked: {msg}")))
        });
        if let Err(err) = outcome {
            tracing::debug!(stream, seq, label, error = %err, "stream job failed");
            state.error.lock().get_or_insert(err);
        }
    }
    state.completed.fetch_add(1, Ordering::Release);
}

impl Drop for Stream {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl core::fmt::Debug for Stream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("submitted", &self.next_seq.load(Ordering::Relaxed))
            .field("completed", &self.completed())
            .finish()
    }
}
