/// Streaming runner module
///
/// Owns the live pipeline behind a single background worker. Producers hand
/// audio batches over a capacity-1 channel, so a slow model pushes back on
/// them instead of letting audio pile up. The worker is the only place the
/// listener and trigger detector are touched.

use crate::audio::{bytes_to_samples, AudioSample};
use crate::detector::{DetectorConfig, TriggerDetector};
use crate::listener::{Listener, ListenerError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Bytes read per batch when no chunk size is configured
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Runner is stopped")]
    Stopped,

    #[error("Runner is closed")]
    Closed,

    #[error("Runner halted after a pipeline error")]
    Faulted,

    #[error("Invalid runner configuration: {0}")]
    InvalidConfig(String),

    #[error("Audio source error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Configuration for the streaming runner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Bytes per batch for stream reads; also scales the detector cooldown.
    /// 0 selects `DEFAULT_CHUNK_SIZE`.
    pub chunk_size: usize,

    /// Trigger detector configuration
    pub detector: DetectorConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            detector: DetectorConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), RunnerError> {
        self.detector
            .validate()
            .map_err(|e| RunnerError::InvalidConfig(e.to_string()))
    }
}

/// Wake-word activation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeWordEvent {
    /// Timestamp when the wake-word fired (microseconds since epoch)
    pub timestamp: i64,

    /// Calibrated probability of the activating batch (0.0 - 1.0)
    pub confidence: f32,
}

/// Runner statistics
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    pub batches_processed: u64,
    pub activations: u64,
    pub is_running: bool,
}

pub type PredictionCallback = Box<dyn FnMut(f32) + Send>;
pub type ActivationCallback = Box<dyn FnMut(WakeWordEvent) + Send>;
pub type ExitCallback = Box<dyn FnMut(Option<RunnerError>) + Send>;

#[derive(Default)]
struct Callbacks {
    on_prediction: Option<PredictionCallback>,
    on_activation: Option<ActivationCallback>,
    on_exit: Option<ExitCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Stopped,
    Faulted,
}

/// Builder for [`Runner`]
pub struct RunnerBuilder {
    listener: Listener,
    config: RunnerConfig,
    callbacks: Callbacks,
}

impl RunnerBuilder {
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Called with every calibrated probability
    pub fn on_prediction(mut self, f: impl FnMut(f32) + Send + 'static) -> Self {
        self.callbacks.on_prediction = Some(Box::new(f));
        self
    }

    /// Called when the trigger detector fires
    pub fn on_activation(mut self, f: impl FnMut(WakeWordEvent) + Send + 'static) -> Self {
        self.callbacks.on_activation = Some(Box::new(f));
        self
    }

    /// Called whenever the worker exits, with the error that ended it if any
    pub fn on_exit(mut self, f: impl FnMut(Option<RunnerError>) + Send + 'static) -> Self {
        self.callbacks.on_exit = Some(Box::new(f));
        self
    }

    /// Create the runner and start its worker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self) -> Result<Runner, RunnerError> {
        self.config.validate()?;

        let chunk_size = self.config.effective_chunk_size();
        let (sample_tx, sample_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(RunState::Running);
        let state = Arc::new(state);
        let shutdown = CancellationToken::new();
        let stats = Arc::new(RwLock::new(RunnerStats::default()));

        let worker = Box::new(Worker {
            listener: Some(self.listener),
            detector: TriggerDetector::new(chunk_size, self.config.detector),
            samples: sample_rx,
            callbacks: self.callbacks,
            state: state.clone(),
            shutdown: shutdown.clone(),
            stats: stats.clone(),
            faulted: false,
        });

        info!("Runner started (chunk size {} bytes)", chunk_size);

        Ok(Runner {
            sample_tx,
            state,
            shutdown,
            chunk_size,
            worker: Mutex::new(WorkerSlot::Running(tokio::spawn(worker.run()))),
            stats,
        })
    }
}

enum WorkerSlot {
    Idle(Box<Worker>),
    Running(JoinHandle<Box<Worker>>),
    Closed,
}

/// Live wake-word pipeline
///
/// Call [`Runner::close`] before dropping it. Dropping an open runner stops
/// the worker but never calls `Model::close`.
pub struct Runner {
    sample_tx: mpsc::Sender<Vec<AudioSample>>,
    state: Arc<watch::Sender<RunState>>,
    shutdown: CancellationToken,
    chunk_size: usize,
    worker: Mutex<WorkerSlot>,
    stats: Arc<RwLock<RunnerStats>>,
}

impl Runner {
    pub fn builder(listener: Listener) -> RunnerBuilder {
        RunnerBuilder {
            listener,
            config: RunnerConfig::default(),
            callbacks: Callbacks::default(),
        }
    }

    /// Restart the worker after `stop`
    pub async fn start(&self) -> Result<(), RunnerError> {
        let mut slot = self.worker.lock().await;

        match std::mem::replace(&mut *slot, WorkerSlot::Closed) {
            WorkerSlot::Closed => Err(RunnerError::Closed),
            WorkerSlot::Running(handle) if *self.state.borrow() == RunState::Running => {
                *slot = WorkerSlot::Running(handle);
                warn!("Runner already running");
                Ok(())
            }
            WorkerSlot::Running(handle) => {
                let worker = self.join(handle).await?;
                self.launch(&mut slot, worker)
            }
            WorkerSlot::Idle(worker) => self.launch(&mut slot, worker),
        }
    }

    /// Stop the worker once it has drained the batches already handed over
    ///
    /// Ingestion calls fail with `Stopped` from the moment this is called.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        if !self.mark_stopped() {
            warn!("Runner not running");
        }

        let mut slot = self.worker.lock().await;
        match std::mem::replace(&mut *slot, WorkerSlot::Closed) {
            WorkerSlot::Running(handle) => {
                let worker = self.join(handle).await?;
                *slot = WorkerSlot::Idle(worker);
                info!("Runner stopped");
            }
            other => *slot = other,
        }

        Ok(())
    }

    /// Terminate the worker without draining and release the model
    pub async fn close(&self) -> Result<(), RunnerError> {
        self.mark_stopped();
        self.shutdown.cancel();

        let mut slot = self.worker.lock().await;
        let mut worker = match std::mem::replace(&mut *slot, WorkerSlot::Closed) {
            WorkerSlot::Closed => return Ok(()),
            WorkerSlot::Idle(worker) => worker,
            WorkerSlot::Running(handle) => handle
                .await
                .map_err(|e| RunnerError::Worker(e.to_string()))?,
        };

        if let Some(listener) = worker.listener.as_mut() {
            listener.close()?;
        }

        info!("Runner closed");
        Ok(())
    }

    /// Hand a batch of samples to the worker
    ///
    /// Waits until the worker is ready to take it.
    pub async fn queue(&self, samples: Vec<AudioSample>) -> Result<(), RunnerError> {
        self.accepting()?;

        let mut state_rx = self.state.subscribe();
        tokio::select! {
            biased;
            sent = self.sample_tx.send(samples) => sent.map_err(|_| RunnerError::Closed),
            _ = self.shutdown.cancelled() => Err(RunnerError::Closed),
            _ = state_rx.wait_for(|s| *s != RunState::Running) => {
                Err(self.accepting().err().unwrap_or(RunnerError::Stopped))
            }
        }
    }

    /// Decode little-endian 16-bit PCM and queue it
    ///
    /// Returns the number of bytes consumed; an odd trailing byte is dropped.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, RunnerError> {
        let samples = bytes_to_samples(bytes);
        let consumed = samples.len() * 2;
        self.queue(samples).await?;
        Ok(consumed)
    }

    /// Queue audio from `reader` in chunk-sized batches until end of stream
    ///
    /// Returns the number of bytes read. A sample split across two reads is
    /// reassembled; an odd byte left at end of stream is dropped.
    pub async fn read_from<R>(&self, mut reader: R) -> Result<u64, RunnerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut carry: Option<u8> = None;
        let mut total = 0u64;

        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            total += read as u64;

            let mut bytes = Vec::with_capacity(read + 1);
            bytes.extend(carry.take());
            bytes.extend_from_slice(&buf[..read]);
            if bytes.len() % 2 == 1 {
                carry = bytes.pop();
            }

            if !bytes.is_empty() {
                self.queue(bytes_to_samples(&bytes)).await?;
            }
        }

        if carry.is_some() {
            debug!("Dropping odd trailing byte at end of stream");
        }
        debug!("Audio source exhausted after {} bytes", total);

        Ok(total)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && *self.state.borrow() == RunState::Running
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Get current statistics
    pub async fn stats(&self) -> RunnerStats {
        let mut stats = self.stats.read().await.clone();
        stats.is_running = self.is_running();
        stats
    }

    fn accepting(&self) -> Result<(), RunnerError> {
        if self.shutdown.is_cancelled() {
            return Err(RunnerError::Closed);
        }
        match *self.state.borrow() {
            RunState::Running => Ok(()),
            RunState::Stopped => Err(RunnerError::Stopped),
            RunState::Faulted => Err(RunnerError::Faulted),
        }
    }

    /// Running -> Stopped; false if it was not running
    fn mark_stopped(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Stopped;
                true
            } else {
                false
            }
        })
    }

    fn launch(&self, slot: &mut WorkerSlot, worker: Box<Worker>) -> Result<(), RunnerError> {
        if worker.faulted {
            *slot = WorkerSlot::Idle(worker);
            return Err(RunnerError::Faulted);
        }

        self.state.send_replace(RunState::Running);
        *slot = WorkerSlot::Running(tokio::spawn(worker.run()));
        info!("Runner started");
        Ok(())
    }

    async fn join(&self, handle: JoinHandle<Box<Worker>>) -> Result<Box<Worker>, RunnerError> {
        handle.await.map_err(|e| {
            self.state.send_replace(RunState::Faulted);
            RunnerError::Worker(e.to_string())
        })
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        let closed = matches!(self.worker.try_lock().as_deref(), Ok(WorkerSlot::Closed));
        if !closed {
            warn!("Runner dropped without close(); the model is dropped without being released");
        }
        self.shutdown.cancel();
    }
}

/// Background side of the runner
struct Worker {
    listener: Option<Listener>,
    detector: TriggerDetector,
    samples: mpsc::Receiver<Vec<AudioSample>>,
    callbacks: Callbacks,
    state: Arc<watch::Sender<RunState>>,
    shutdown: CancellationToken,
    stats: Arc<RwLock<RunnerStats>>,
    faulted: bool,
}

impl Worker {
    async fn run(mut self: Box<Self>) -> Box<Self> {
        let shutdown = self.shutdown.clone();
        let mut state_rx = self.state.subscribe();
        let mut failure = None;

        debug!("Runner worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                batch = self.samples.recv() => batch,
                _ = state_rx.wait_for(|s| *s != RunState::Running) => None,
            };

            let Some(samples) = next else {
                break;
            };

            if let Err(e) = self.process(samples).await {
                error!("Pipeline error, stopping runner: {}", e);
                self.faulted = true;
                self.state.send_replace(RunState::Faulted);
                failure = Some(e);
                break;
            }
        }

        if let Some(on_exit) = self.callbacks.on_exit.as_mut() {
            on_exit(failure);
        }

        debug!("Runner worker exited");
        self
    }

    async fn process(&mut self, samples: Vec<AudioSample>) -> Result<(), RunnerError> {
        let mut listener = self
            .listener
            .take()
            .ok_or(RunnerError::Listener(ListenerError::ModelUnavailable))?;

        // Inference may block for a while; keep it off the async workers
        let (listener, result) = tokio::task::spawn_blocking(move || {
            let result = listener.update(&samples);
            (listener, result)
        })
        .await
        .map_err(|e| RunnerError::Worker(e.to_string()))?;

        self.listener = Some(listener);
        let prob = result?;

        if let Some(on_prediction) = self.callbacks.on_prediction.as_mut() {
            on_prediction(prob);
        }

        let activated = self.detector.update(prob);
        trace!("prob={:.3} activation={}", prob, self.detector.activation());

        {
            let mut stats = self.stats.write().await;
            stats.batches_processed += 1;
            if activated {
                stats.activations += 1;
            }
        }

        if activated {
            info!("Wake-word detected! confidence={:.2}", prob);

            if let Some(on_activation) = self.callbacks.on_activation.as_mut() {
                on_activation(WakeWordEvent {
                    timestamp: current_timestamp_micros(),
                    confidence: prob,
                });
            }
        }

        Ok(())
    }
}

/// Get current timestamp in microseconds
fn current_timestamp_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}
