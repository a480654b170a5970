use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::{Result, RtspError};

/// A unit of work executed by the write queue's worker.
pub type WriteTask = Box<dyn FnOnce() -> Result<()> + Send>;

/// Bounded single-consumer queue serializing a session's outbound writes.
///
/// Tasks run one at a time in push order on a dedicated worker thread, so
/// RTP and RTCP of every media in a session reach the wire in the order
/// they were accepted. [`push`](Self::push) never blocks: when `capacity`
/// tasks are pending it fails with [`RtspError::WriteQueueFull`].
///
/// Failing tasks are handed to the `on_error` callback given to
/// [`start`](Self::start). An error for which
/// [`RtspError::stops_writer`] holds also stops the worker; later pushes
/// fail with [`RtspError::WriteQueueClosed`].
pub struct WriteQueue {
    capacity: usize,
    tx: Mutex<Option<SyncSender<WriteTask>>>,
    rx: Mutex<Option<Receiver<WriteTask>>>,
    /// Held from hand-over until the accept hook of [`push_then`](Self::push_then)
    /// returns; the worker takes it before running each task.
    handover: Arc<Mutex<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity);
        Self {
            capacity,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            handover: Arc::new(Mutex::new(())),
            worker: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a task.
    pub fn push<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.push_then(task, || {})
    }

    /// Enqueue a task and run `on_accepted` once it is queued.
    ///
    /// `on_accepted` returns before the worker can start the task.
    pub fn push_then<F, A>(&self, task: F, on_accepted: A) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
        A: FnOnce(),
    {
        let _handover = self.handover.lock();
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(RtspError::WriteQueueClosed);
        };

        match tx.try_send(Box::new(task)) {
            Ok(()) => {
                on_accepted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(capacity = self.capacity, "write queue full");
                Err(RtspError::WriteQueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(RtspError::WriteQueueClosed),
        }
    }

    /// Spawn the worker. Tasks pushed before this call run first.
    pub fn start<E>(&self, on_error: E) -> Result<()>
    where
        E: Fn(RtspError) + Send + 'static,
    {
        let rx = self.rx.lock().take().ok_or(RtspError::AlreadyStarted)?;
        let handover = self.handover.clone();
        let worker = thread::Builder::new()
            .name("rtsp-writer".to_string())
            .spawn(move || run(rx, &handover, on_error))?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// Close the queue, let the worker drain pending tasks and join it.
    pub fn stop(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run<E: Fn(RtspError)>(rx: Receiver<WriteTask>, handover: &Mutex<()>, on_error: E) {
    while let Ok(task) = rx.recv() {
        drop(handover.lock());

        if let Err(e) = task() {
            let stop = e.stops_writer();
            tracing::warn!(error = %e, stop, "write failed");
            on_error(e);
            if stop {
                return;
            }
        }
    }
    tracing::debug!("write queue drained");
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
