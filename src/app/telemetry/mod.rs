use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::app::metrics::{self, LossSample, Sample, WeightSample};
use crate::domain::process::{OutputLine, ProcessHandle};

/// Everything the reader thread hands over to the UI tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Sample(Sample),
    Output(OutputLine),
    Error(String),
    Finished(Option<i32>),
}

/// Producer half, owned by the reader thread.
#[derive(Debug, Clone)]
pub struct TelemetrySender {
    tx: Sender<TelemetryEvent>,
}

impl TelemetrySender {
    /// Returns `false` once the consumer has gone away.
    pub fn post(&self, sample: Sample) -> bool {
        self.send(TelemetryEvent::Sample(sample))
    }

    pub fn post_output(&self, line: OutputLine) -> bool {
        self.send(TelemetryEvent::Output(line))
    }

    pub fn post_error(&self, message: impl Into<String>) -> bool {
        self.send(TelemetryEvent::Error(message.into()))
    }

    pub fn finish(&self, code: Option<i32>) -> bool {
        self.send(TelemetryEvent::Finished(code))
    }

    fn send(&self, event: TelemetryEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Consumer half, drained from the UI loop on every tick.
#[derive(Debug)]
pub struct TelemetryReceiver {
    rx: Receiver<TelemetryEvent>,
    disconnected: bool,
}

impl TelemetryReceiver {
    /// Everything posted since the last drain, in posting order. Never blocks.
    pub fn drain(&mut self) -> Vec<TelemetryEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        events
    }

    /// True once every sender is gone and the queue has been emptied.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

/// Unbounded FIFO between exactly one reader thread and the UI tick.
pub fn telemetry_channel() -> (TelemetrySender, TelemetryReceiver) {
    let (tx, rx) = mpsc::channel();
    (
        TelemetrySender { tx },
        TelemetryReceiver {
            rx,
            disconnected: false,
        },
    )
}

/// Starts the reader for a streaming child. Recognized progress markers are
/// posted as samples, every other line as output; the exit code follows once
/// both output streams have closed.
pub fn spawn_reader(handle: ProcessHandle, sender: TelemetrySender) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Some(line) = handle.read_line() {
            let delivered = match metrics::parse(line.text()).into_sample() {
                Some(sample) => sender.post(sample),
                None => sender.post_output(line),
            };
            if !delivered {
                debug!(pid = handle.pid(), "telemetry consumer gone; reader exiting");
                return;
            }
        }

        let outcome = handle.controller().wait();
        // Release this thread's hold on the streaming slot before announcing
        // the exit, so the consumer can start the next run right away.
        drop(handle);
        match outcome {
            Ok(code) => {
                sender.finish(code);
            }
            Err(error) => {
                warn!(%error, "failed to wait for streaming child");
                sender.post_error(format!("Failed to wait for process: {error}"));
                sender.finish(None);
            }
        }
    })
}

/// Append-only series shared between the UI tick and renderers.
///
/// Readers get an `Arc` of the current contents and render without holding
/// the lock; an append while a snapshot is outstanding copies the vector
/// instead of mutating what the reader sees.
#[derive(Debug)]
pub struct SeriesBuffer<T> {
    inner: Mutex<Arc<Vec<T>>>,
}

pub type LiveSeries = SeriesBuffer<LossSample>;
pub type WeightTrail = SeriesBuffer<WeightSample>;

impl<T> Default for SeriesBuffer<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Arc::new(Vec::new())),
        }
    }
}

impl<T: Clone> SeriesBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.lock() = Arc::new(Vec::new());
    }

    pub fn append(&self, item: T) {
        let mut guard = self.lock();
        Arc::make_mut(&mut guard).push(item);
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<T> {
        self.lock().last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Arc<Vec<T>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
