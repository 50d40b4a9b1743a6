//! Smooth transitions of dimmable outputs.
//!
//! A transition moves one or more outputs (its *legs*) from their current
//! values to new ones over a duration. There are two ways to do it:
//!
//! - **Hardware**: the port has smooth dimming configured on the device. One
//!   `pt=<port>&pwm=<to>&cnt=<ticks>` command per leg, and the device ramps by
//!   itself. `ticks = max(round(duration_secs × |to - from| / max_value), 1)`.
//! - **Software**: the scheduler samples a [`SmoothSteps`] per leg every tick
//!   (50 ms by default) and sends the combined values whenever they change.
//!   Samples follow wall-clock time, so slow ticks skip values instead of
//!   stretching the ramp, and the last value sent is always the target.
//!
//! # Encodings
//!
//! | Encoding | One leg | Several legs |
//! |----------|---------|--------------|
//! | [`Encoding::Plain`] | `pt=7&cmd=7:128` | `cmd=7:128;8:64` |
//! | [`Encoding::PackedHex`] | `pt=7&chip=100&ws=80` | `pt=7&chip=100&ws=804000` |
//!
//! # Jobs
//!
//! Every transition runs as a task keyed by a job id (usually the output's
//! name). Starting a transition for a job that is still running cancels the
//! old task first, so an output never has two ramps fighting over it.
//! Cancellation is checked at every tick and while waiting for the device
//! channel; a request already on the wire is allowed to finish, but nothing
//! is sent after that.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rs_megad::channel::DeviceChannel;
//! use rs_megad::config::{ChannelConfig, DeviceConfig, TransitionConfig};
//! use rs_megad::hal::MockTransport;
//! use rs_megad::transition::{Leg, TransitionOutcome, TransitionRequest, TransitionScheduler};
//! use rs_megad::{PortId, PortStateStore};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap();
//! # rt.block_on(async {
//! let mock = MockTransport::new();
//! let channel = Arc::new(DeviceChannel::new(
//!     mock.clone(),
//!     &DeviceConfig::new("10.0.0.14", "sec"),
//!     ChannelConfig::default(),
//! ));
//! let scheduler = TransitionScheduler::new(channel, Arc::new(PortStateStore::new()), TransitionConfig::default());
//!
//! let request = TransitionRequest::new(
//!     "kitchen",
//!     vec![Leg::new(PortId::from(7), 0.0, 255.0, 255)],
//!     Duration::from_secs(1),
//! );
//! let task = scheduler.start_transition(request);
//! assert_eq!(task.join().await.unwrap(), TransitionOutcome::Completed);
//! assert_eq!(mock.requests().last().unwrap(), "pt=7&cmd=7:255");
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, Instrument};

use crate::channel::{DeviceChannel, Query};
use crate::config::TransitionConfig;
use crate::error::{Error, Result};
use crate::port::{PortId, PortValue};
use crate::priority::PRIORITY_EXPEDITED;
use crate::store::PortStateStore;
use crate::traits::{Curve, RampCurve, Transport};

/// LED driver count sent with packed commands when none is configured.
pub const DEFAULT_CHIP: u32 = 100;

// ============================================================================
// Request
// ============================================================================

/// How the values of a software tick are put on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Encoding {
    /// `port:value` pairs joined by `;`.
    #[default]
    Plain,
    /// One two-digit hex byte per leg, for addressable LED strips.
    PackedHex {
        /// Number of LED drivers on the strip.
        chip: u32,
    },
}

/// One output moving from `from` to `to`.
#[derive(Clone, Debug, PartialEq)]
pub struct Leg {
    /// Output port.
    pub port: PortId,
    /// Start value.
    pub from: f64,
    /// Target value.
    pub to: f64,
    /// Full scale of the port (255 or 4095).
    pub max_value: u32,
}

impl Leg {
    /// Creates a leg.
    pub fn new(port: PortId, from: f64, to: f64, max_value: u32) -> Self {
        Self {
            port,
            from,
            to,
            max_value,
        }
    }

    /// Ramp length in device ticks for a hardware transition.
    pub fn hardware_ticks(&self, duration: Duration) -> u32 {
        let max = f64::from(self.max_value.max(1));
        let ticks = (duration.as_secs_f64() * (self.to - self.from).abs() / max).round();
        (ticks as u32).max(1)
    }
}

/// Called with the leg values every time they change.
pub type Updater = Arc<dyn Fn(&[f64]) + Send + Sync>;

/// Everything needed to run one transition.
#[derive(Clone)]
pub struct TransitionRequest {
    /// Logical output this transition belongs to.
    pub job_id: String,
    /// Outputs to move.
    pub legs: Vec<Leg>,
    /// Total duration.
    pub duration: Duration,
    /// Let the device ramp by itself.
    pub hardware_capable: bool,
    /// Wire format of software ticks.
    pub encoding: Encoding,
    /// Software tick; the scheduler default when `None`.
    pub tick: Option<Duration>,
    /// Software ramp curve; the scheduler default when `None`.
    pub curve: Option<Curve>,
    /// Progress callback.
    pub updater: Option<Updater>,
}

impl TransitionRequest {
    /// Creates a software transition with plain encoding.
    pub fn new(job_id: impl Into<String>, legs: Vec<Leg>, duration: Duration) -> Self {
        Self {
            job_id: job_id.into(),
            legs,
            duration,
            hardware_capable: false,
            encoding: Encoding::Plain,
            tick: None,
            curve: None,
            updater: None,
        }
    }

    /// Set whether the device ramps by itself
    pub fn with_hardware(mut self, capable: bool) -> Self {
        self.hardware_capable = capable;
        self
    }

    /// Set the wire encoding
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the software tick
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Set the ramp curve
    pub fn with_curve(mut self, curve: Curve) -> Self {
        self.curve = Some(curve);
        self
    }

    /// Set the progress callback
    pub fn with_updater(mut self, updater: impl Fn(&[f64]) + Send + Sync + 'static) -> Self {
        self.updater = Some(Arc::new(updater));
        self
    }

    fn targets(&self) -> Vec<f64> {
        self.legs.iter().map(|l| l.to).collect()
    }
}

impl fmt::Debug for TransitionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionRequest")
            .field("job_id", &self.job_id)
            .field("legs", &self.legs)
            .field("duration", &self.duration)
            .field("hardware_capable", &self.hardware_capable)
            .field("encoding", &self.encoding)
            .field("tick", &self.tick)
            .field("curve", &self.curve)
            .field("updater", &self.updater.is_some())
            .finish()
    }
}

// ============================================================================
// Step generator
// ============================================================================

/// Values of one leg over time.
///
/// Each call to [`next`](Iterator::next) samples the curve at the time elapsed
/// since creation. Intermediate values are whole numbers within the range of
/// the leg; once the duration is over the generator yields `to` forever.
///
/// ```rust
/// use std::time::Duration;
/// use rs_megad::traits::Linear;
/// use rs_megad::transition::SmoothSteps;
///
/// let steps = SmoothSteps::new(0.0, 100.0, Duration::from_secs(1), Linear);
/// assert_eq!(steps.value_at(Duration::from_millis(250)), 25.0);
/// assert_eq!(steps.value_at(Duration::from_secs(5)), 100.0);
/// ```
#[derive(Clone, Debug)]
pub struct SmoothSteps<C = Curve> {
    from: f64,
    to: f64,
    duration_ms: u64,
    started: Instant,
    curve: C,
}

impl<C: RampCurve> SmoothSteps<C> {
    /// Starts a generator now.
    pub fn new(from: f64, to: f64, duration: Duration, curve: C) -> Self {
        Self {
            from,
            to,
            duration_ms: duration.as_millis() as u64,
            started: Instant::now(),
            curve,
        }
    }

    /// Value after `elapsed`.
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        let (value, done) =
            self.curve
                .interpolate(self.from, self.to, elapsed.as_millis() as u64, self.duration_ms);
        if done {
            return self.to;
        }
        let (lo, hi) = if self.from <= self.to {
            (self.from, self.to)
        } else {
            (self.to, self.from)
        };
        value.round().clamp(lo, hi)
    }

    /// Returns true once the duration is over.
    pub fn is_exhausted(&self) -> bool {
        self.started.elapsed().as_millis() as u64 >= self.duration_ms
    }
}

impl<C: RampCurve> Iterator for SmoothSteps<C> {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        Some(self.value_at(self.started.elapsed()))
    }
}

// ============================================================================
// Wire encoding
// ============================================================================

fn hex_byte(value: f64) -> String {
    format!("{:02X}", value.round().clamp(0.0, 255.0) as u8)
}

/// Query of one software tick.
pub fn encode_tick(legs: &[Leg], values: &[f64], encoding: Encoding) -> Query {
    match encoding {
        Encoding::Plain => {
            let cmd = legs
                .iter()
                .zip(values)
                .map(|(leg, value)| format!("{}:{}", leg.port, value))
                .collect::<Vec<_>>()
                .join(";");
            let query = match legs {
                [single] => Query::port(&single.port),
                _ => Query::new(),
            };
            query.param("cmd", cmd)
        }
        Encoding::PackedHex { chip } => {
            let ws: String = values.iter().map(|v| hex_byte(*v)).collect();
            let first = legs.first().map(|l| &l.port);
            Query::new()
                .param_opt("pt", first)
                .param("chip", chip)
                .param("ws", ws)
        }
    }
}

/// Query of one hardware ramp command.
pub fn encode_hardware(leg: &Leg, duration: Duration) -> Query {
    Query::port(&leg.port)
        .param("pwm", leg.to)
        .param("cnt", leg.hardware_ticks(duration))
}

// ============================================================================
// Tasks
// ============================================================================

/// How a transition ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The target was sent.
    Completed,
    /// Cancelled before reaching the target.
    Cancelled,
}

/// Handle to a running transition.
#[derive(Debug)]
pub struct TransitionTask {
    job_id: String,
    token: CancellationToken,
    handle: JoinHandle<Result<TransitionOutcome>>,
}

impl TransitionTask {
    /// Job the task belongs to.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Stops the task at its next tick or channel wait.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns true once the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to stop.
    pub async fn join(self) -> Result<TransitionOutcome> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[derive(Debug)]
struct Job {
    id: u64,
    token: CancellationToken,
}

type Jobs = Arc<Mutex<HashMap<String, Job>>>;

fn lock(jobs: &Jobs) -> MutexGuard<'_, HashMap<String, Job>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Scheduler
// ============================================================================

/// Runs transitions for one device, at most one per job id.
pub struct TransitionScheduler<T> {
    channel: Arc<DeviceChannel<T>>,
    store: Arc<PortStateStore>,
    config: TransitionConfig,
    jobs: Jobs,
    next_id: AtomicU64,
}

impl<T: Transport> TransitionScheduler<T> {
    /// Creates a scheduler sending through `channel` and recording into `store`.
    pub fn new(
        channel: Arc<DeviceChannel<T>>,
        store: Arc<PortStateStore>,
        config: TransitionConfig,
    ) -> Self {
        Self {
            channel,
            store,
            config,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &TransitionConfig {
        &self.config
    }

    /// Starts a transition, cancelling any running one with the same job id.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_transition(&self, request: TransitionRequest) -> TransitionTask {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut jobs = lock(&self.jobs);
            if let Some(previous) = jobs.remove(&request.job_id) {
                debug!(job = %request.job_id, "cancelling running transition");
                previous.token.cancel();
            }
            jobs.insert(
                request.job_id.clone(),
                Job {
                    id,
                    token: token.clone(),
                },
            );
        }

        let job_id = request.job_id.clone();
        let runner = Runner {
            channel: Arc::clone(&self.channel),
            store: Arc::clone(&self.store),
            tick: request.tick.unwrap_or_else(|| self.config.tick()),
            curve: request.curve.unwrap_or(self.config.curve),
            token: token.clone(),
        };
        let jobs = Arc::clone(&self.jobs);
        let span = tracing::debug_span!("transition", job = %job_id);

        let handle = tokio::spawn(
            async move {
                let result = runner.run(&request).await;
                let mut jobs = lock(&jobs);
                if jobs.get(&request.job_id).is_some_and(|j| j.id == id) {
                    jobs.remove(&request.job_id);
                }
                result
            }
            .instrument(span),
        );

        TransitionTask {
            job_id,
            token,
            handle,
        }
    }
}

impl<T> TransitionScheduler<T> {
    /// Cancels the running transition of a job. Returns false if none was running.
    pub fn cancel(&self, job_id: &str) -> bool {
        match lock(&self.jobs).remove(job_id) {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every running transition.
    pub fn cancel_all(&self) {
        let mut jobs = lock(&self.jobs);
        if !jobs.is_empty() {
            info!(jobs = jobs.len(), "cancelling all transitions");
        }
        for (_, job) in jobs.drain() {
            job.token.cancel();
        }
    }

    /// Job ids with a running transition, sorted.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.jobs).keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl<T> fmt::Debug for TransitionScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionScheduler")
            .field("config", &self.config)
            .field("jobs", &lock(&self.jobs).len())
            .finish()
    }
}

/// State moved into a transition task.
struct Runner<T> {
    channel: Arc<DeviceChannel<T>>,
    store: Arc<PortStateStore>,
    tick: Duration,
    curve: Curve,
    token: CancellationToken,
}

impl<T: Transport> Runner<T> {
    async fn run(&self, request: &TransitionRequest) -> Result<TransitionOutcome> {
        let result = if request.hardware_capable {
            self.run_hardware(request).await
        } else {
            self.run_software(request).await
        };
        match result {
            Err(Error::Cancelled) => Ok(TransitionOutcome::Cancelled),
            other => other,
        }
    }

    async fn send(&self, query: &Query) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.channel
            .request_cancellable(PRIORITY_EXPEDITED, query, &self.token)
            .await?;
        Ok(())
    }

    fn publish(&self, request: &TransitionRequest, values: &[f64]) {
        for (leg, value) in request.legs.iter().zip(values) {
            self.store.set(leg.port.clone(), PortValue::Numeric(*value));
        }
        if let Some(updater) = &request.updater {
            updater(values);
        }
    }

    async fn run_hardware(&self, request: &TransitionRequest) -> Result<TransitionOutcome> {
        debug!(legs = request.legs.len(), duration = ?request.duration, "hardware ramp");
        for leg in &request.legs {
            self.send(&encode_hardware(leg, request.duration)).await?;
        }
        self.publish(request, &request.targets());
        Ok(TransitionOutcome::Completed)
    }

    async fn run_software(&self, request: &TransitionRequest) -> Result<TransitionOutcome> {
        let targets = request.targets();
        let mut steps: Vec<SmoothSteps> = request
            .legs
            .iter()
            .map(|leg| SmoothSteps::new(leg.from, leg.to, request.duration, self.curve))
            .collect();
        let mut last: Option<Vec<f64>> = None;
        debug!(legs = steps.len(), duration = ?request.duration, tick = ?self.tick, "software ramp");

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(TransitionOutcome::Cancelled),
                _ = tokio::time::sleep(self.tick) => {}
            }

            let values: Vec<f64> = steps
                .iter_mut()
                .zip(&targets)
                .map(|(s, target)| s.next().unwrap_or(*target))
                .collect();
            if last.as_ref() == Some(&values) {
                continue;
            }

            trace!(?values, "tick");
            self.send(&encode_tick(&request.legs, &values, request.encoding))
                .await?;
            self.publish(request, &values);

            if values == targets {
                return Ok(TransitionOutcome::Completed);
            }
            last = Some(values);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
