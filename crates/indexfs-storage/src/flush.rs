//! Async flush queue
//!
//! A single background thread runs flush tasks in submission order. A
//! barrier resolves once every task submitted before it has run, carrying
//! the first failure seen since the previous barrier.

use crossbeam_channel::{Sender, unbounded};
use indexfs_common::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type FlushTask = Box<dyn FnOnce() -> Result<()> + Send>;

enum Command {
    Task(FlushTask),
    Barrier(oneshot::Sender<Result<()>>),
}

#[derive(Debug)]
pub struct FlushQueue {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<AtomicU64>,
}

impl FlushQueue {
    /// Start the worker thread
    pub fn start(name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded::<Command>();
        let pending = Arc::new(AtomicU64::new(0));
        let worker_pending = Arc::clone(&pending);
        let worker = std::thread::Builder::new()
            .name(format!("flush-{name}"))
            .spawn(move || {
                let mut first_error: Option<Error> = None;
                for command in receiver {
                    match command {
                        Command::Task(task) => {
                            if let Err(e) = task() {
                                warn!("Async flush task failed: {}", e);
                                first_error.get_or_insert(e);
                            }
                            worker_pending.fetch_sub(1, Ordering::Relaxed);
                        }
                        Command::Barrier(done) => {
                            let _ = done.send(first_error.take().map_or(Ok(()), Err));
                        }
                    }
                }
                debug!("Flush worker stopped");
            })
            .map_err(|e| Error::internal(format!("failed to start flush worker: {e}")))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            pending,
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::internal("flush queue stopped"))?
            .send(command)
            .map_err(|_| Error::internal("flush worker is gone"))
    }

    pub fn submit(&self, task: FlushTask) -> Result<()> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.send(Command::Task(task)).inspect_err(|_| {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        })
    }

    /// Future resolving once all earlier tasks have run
    pub fn barrier(&self) -> SyncFuture {
        let (tx, rx) = oneshot::channel();
        match self.send(Command::Barrier(tx)) {
            Ok(()) => SyncFuture::pending(rx),
            Err(e) => SyncFuture::ready(Err(e)),
        }
    }

    /// Tasks submitted but not finished
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }
}

impl Drop for FlushQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[derive(Debug)]
enum SyncState {
    Ready(Option<Result<()>>),
    Pending(oneshot::Receiver<Result<()>>),
}

/// Completion of a `sync`
///
/// Block on it with [`SyncFuture::wait`] or `.await` it from async code.
#[derive(Debug)]
pub struct SyncFuture {
    state: SyncState,
}

impl SyncFuture {
    pub const fn ready(result: Result<()>) -> Self {
        Self {
            state: SyncState::Ready(Some(result)),
        }
    }

    const fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            state: SyncState::Pending(rx),
        }
    }

    pub const fn is_ready(&self) -> bool {
        matches!(self.state, SyncState::Ready(_))
    }

    /// Block until the flush finished
    pub fn wait(self) -> Result<()> {
        match self.state {
            SyncState::Ready(result) => result.unwrap_or(Ok(())),
            SyncState::Pending(rx) => rx
                .blocking_recv()
                .map_err(|_| Error::internal("flush worker dropped the barrier"))?,
        }
    }
}

impl Future for SyncFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            SyncState::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            SyncState::Pending(rx) => Pin::new(rx).poll(cx).map(|r| {
                r.map_err(|_| Error::internal("flush worker dropped the barrier"))?
            }),
        }
    }
}
