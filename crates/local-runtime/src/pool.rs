//! Bounded pool of inference threads.
//!
//! Blocking backend work (tensor math, native calls) runs here so the async
//! dispatcher never stalls. Two entry points:
//! - `run` offloads one blocking call and awaits its result;
//! - `stream` runs a blocking producer that pushes fragments through a
//!   bounded channel, always ending with a terminal sentinel.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::adapter::{Fragment, FragmentStream};
use crate::registry::SlotLease;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default capacity of a streaming pump's fragment queue.
pub const DEFAULT_PUMP_CAPACITY: usize = 32;

struct WorkerThread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    fn spawn(name: String, jobs: Receiver<Job>) -> std::io::Result<Self> {
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(job) = jobs.recv() {
                job();
            }
            debug!("Inference thread {} exiting", thread::current().name().unwrap_or("?"));
        })?;
        Ok(Self {
            name,
            handle: Some(handle),
        })
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The last pool handle may be dropped from inside a job.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Inference thread {} panicked", self.name);
            }
        }
    }
}

struct PoolInner {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<WorkerThread>>,
    size: usize,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Closing the queue lets every worker drain and exit.
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            workers.clear();
        }
    }
}

/// Cheap-to-clone handle on the pool.
#[derive(Clone)]
pub struct InferencePool {
    inner: Arc<PoolInner>,
}

impl InferencePool {
    pub fn new(threads: usize) -> anyhow::Result<Self> {
        let size = threads.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            workers.push(WorkerThread::spawn(format!("inference-{}", i), rx.clone())?);
        }
        info!("Inference pool started with {} thread(s)", size);
        Ok(Self {
            inner: Arc::new(PoolInner {
                sender: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
                size,
            }),
        })
    }

    /// Thread count derived from the machine: half the cores, 1..=4.
    pub fn default_threads() -> usize {
        (num_cpus::get() / 2).clamp(1, 4)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Handle whose jobs each carry `lease` until they finish on their
    /// thread, whether or not anyone still awaits them.
    pub fn scoped(&self, lease: Option<SlotLease>) -> ScopedPool<'_> {
        ScopedPool { pool: self, lease }
    }

    fn submit(&self, job: Job) -> anyhow::Result<()> {
        let guard = self
            .inner
            .sender
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire inference pool lock"))?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Inference pool is shut down"))?;
        sender
            .send(job)
            .map_err(|_| anyhow::anyhow!("Failed to send job to inference pool"))
    }

    /// Run a blocking call on the pool and await its result.
    pub async fn run<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            if tx.is_closed() {
                debug!("Skipping inference job whose caller went away");
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("inference job panicked")));
            // Receiver gone means the caller was cancelled; nothing to report.
            let _ = tx.send(result);
        }))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("inference job dropped before completing"))?
    }

    /// Run a blocking producer on the pool and consume its fragments as a
    /// stream, in production order.
    ///
    /// Dropping the returned stream cancels the producer: its next
    /// `FragmentSink::send` fails and the thread goes back to the pool.
    pub fn stream<F>(&self, capacity: usize, producer: F) -> FragmentStream
    where
        F: FnOnce(&FragmentSink) -> anyhow::Result<()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<PumpItem>(capacity.max(1));
        let sink = FragmentSink { tx };

        let submitted = self.submit(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| producer(&sink)))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("stream producer panicked")));
            let sentinel = match outcome {
                Ok(()) => PumpItem::Finished,
                Err(e) => PumpItem::Failed(format!("{:#}", e)),
            };
            if sink.tx.blocking_send(sentinel).is_err() {
                debug!("Stream consumer went away before the producer finished");
            }
        }));

        let stream = async_stream::stream! {
            if let Err(e) = submitted {
                yield Err(e);
                return;
            }
            loop {
                match rx.recv().await {
                    Some(PumpItem::Fragment(fragment)) => yield Ok(fragment),
                    Some(PumpItem::Finished) => break,
                    Some(PumpItem::Failed(message)) => {
                        yield Err(anyhow::anyhow!(message));
                        break;
                    }
                    None => {
                        warn!("Stream producer exited without a terminal sentinel");
                        yield Err(anyhow::anyhow!("stream producer exited unexpectedly"));
                        break;
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

/// The pool as seen by one run: work submitted through it keeps the run's
/// concurrency slot busy until it has actually stopped.
pub struct ScopedPool<'a> {
    pool: &'a InferencePool,
    lease: Option<SlotLease>,
}

impl ScopedPool<'_> {
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub async fn run<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let lease = self.lease.clone();
        self.pool
            .run(move || {
                let _lease = lease;
                f()
            })
            .await
    }

    pub fn stream<F>(&self, capacity: usize, producer: F) -> FragmentStream
    where
        F: FnOnce(&FragmentSink) -> anyhow::Result<()> + Send + 'static,
    {
        let lease = self.lease.clone();
        self.pool.stream(capacity, move |sink| {
            let _lease = lease;
            producer(sink)
        })
    }
}

enum PumpItem {
    Fragment(Fragment),
    Finished,
    Failed(String),
}

/// Producer side of a streaming pump. Lives on an inference thread.
pub struct FragmentSink {
    tx: mpsc::Sender<PumpItem>,
}

impl FragmentSink {
    /// Hand one fragment to the consumer, blocking while the queue is full.
    ///
    /// Fails once the consumer has gone away; producers should stop then.
    pub fn send(&self, fragment: Fragment) -> anyhow::Result<()> {
        self.tx
            .blocking_send(PumpItem::Fragment(fragment))
            .map_err(|_| anyhow::anyhow!("stream consumer cancelled"))
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}
