//! Test orchestration: phase state machine, worker pools and events
//!
//! The orchestrator owns the run state machine (WAITING, then the
//! configured phase order, then FINISHED or ABORTED; no state revisited)
//! and is the only writer of the shared `TestRun`. Throughput phases run a
//! fixed pool of worker tasks, each looping "transfer, report, repeat"
//! until the phase stop condition fires; workers report byte deltas and
//! errors over channels that the orchestrator's event loop consumes, so
//! counter mutation stays serialized no matter how many transfers are in
//! flight. Latency probes run sequentially, one timed request at a time.

pub mod run;

pub use run::TestRun;

use crate::client::{HttpBackend, TransferBackend};
use crate::error::Result;
use crate::logging::Logger;
use crate::models::config::Config;
use crate::models::result::{ProgressSnapshot, TestResult};
use crate::stabilize::StabilityDetector;
use crate::stats::{aggregate_latency, throughput_mbps};
use crate::types::{Phase, TransferDirection};
use bytes::Bytes;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, sleep_until, Instant as TokioInstant, MissedTickBehavior};

/// Brief pause before retrying after a failed transfer or probe, so a dead
/// endpoint cannot hot-spin the pool within the phase budget
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// How long a cancelled worker gets to wind down cooperatively before its
/// task is aborted outright
const WORKER_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Update event callback: receives bounded-rate progress snapshots
pub type UpdateCallback = dyn Fn(ProgressSnapshot) + Send + Sync;

/// Terminal event callback: receives `aborted`, fired exactly once per run
pub type EndCallback = dyn Fn(bool) + Send + Sync;

/// How a phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    /// Budget exhausted, speed stabilized, or required samples collected
    Completed,
    /// The run-level abort fired mid-phase
    Aborted,
}

/// Abort signal shared between the run loop and external callers
#[derive(Debug, Default)]
struct AbortSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    fn raise(&self) -> bool {
        let newly_raised = !self.raised.swap(true, Ordering::SeqCst);
        if newly_raised {
            self.notify.notify_waiters();
        }
        newly_raised
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

/// One download or upload job description for a pool worker
enum WorkerJob {
    Download { url: String },
    Upload { url: String, payload: Bytes },
}

/// Client-driven speed test orchestrator.
///
/// Construct with a validated [`Config`], optionally attach event sinks,
/// then drive with [`start`](Self::start). Clones share the same run: a
/// clone can call [`abort`](Self::abort) or [`results`](Self::results)
/// while another task awaits `start`. An aborted orchestrator stays
/// aborted; build a new one to measure again.
#[derive(Clone)]
pub struct SpeedTest {
    config: Arc<Config>,
    backend: Arc<dyn TransferBackend>,
    run: Arc<Mutex<TestRun>>,
    abort: Arc<AbortSignal>,
    end_fired: Arc<AtomicBool>,
    on_update: Option<Arc<UpdateCallback>>,
    on_end: Option<Arc<EndCallback>>,
    logger: Logger,
}

impl std::fmt::Debug for SpeedTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedTest").finish_non_exhaustive()
    }
}

impl SpeedTest {
    /// Create an orchestrator over the real HTTP transport.
    ///
    /// Configuration violations are fatal here, never mid-run.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(HttpBackend::new(config.request_timeout())?);
        Ok(Self::assemble(config, backend))
    }

    /// Create an orchestrator over a caller-supplied transport
    pub fn with_backend(config: Config, backend: Arc<dyn TransferBackend>) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, backend))
    }

    fn assemble(config: Config, backend: Arc<dyn TransferBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            run: Arc::new(Mutex::new(TestRun::new(uuid::Uuid::new_v4()))),
            abort: Arc::new(AbortSignal::default()),
            end_fired: Arc::new(AtomicBool::new(false)),
            on_update: None,
            on_end: None,
            logger: Logger::default(),
        }
    }

    /// Attach the update event sink
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressSnapshot) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(callback));
        self
    }

    /// Attach the terminal event sink
    pub fn on_end<F>(mut self, callback: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_end = Some(Arc::new(callback));
        self
    }

    /// Replace the default logger
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Request cancellation of the run. Valid from any state; calling it
    /// after termination (or repeatedly) is a no-op.
    pub fn abort(&self) {
        if self.abort.raise() {
            self.logger.info("orchestrator", "abort requested");
        }
    }

    /// Latest result record: partial before completion, final after
    pub fn results(&self) -> TestResult {
        self.run_lock().result()
    }

    /// Latest progress snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.run_lock().snapshot()
    }

    /// Resolve the caller's public-address descriptor through the
    /// configured lookup endpoint. Independent of the phase state machine;
    /// callable before, during or after a run.
    pub async fn lookup_ip(&self) -> Result<String> {
        let url = self.config.ip_lookup_url.as_deref().ok_or_else(|| {
            crate::error::AppError::config("No ip-lookup URL configured")
        })?;
        self.backend.fetch_ip(url).await
    }

    /// Run the configured phases to completion or abort.
    ///
    /// Per-request errors are handled inside the phases (retried or
    /// counted, degrading the affected metric); they never surface here,
    /// so the returned record is always a terminal `TestResult`.
    pub async fn start(&self) -> TestResult {
        self.end_fired.store(false, Ordering::SeqCst);
        {
            let mut run = self.run_lock();
            *run = TestRun::new(uuid::Uuid::new_v4());
        }
        self.logger.info("orchestrator", "run started");

        let mut aborted = self.abort.is_raised();
        if !aborted {
            for phase in self.config.test_order.iter().copied() {
                if self.abort.is_raised() {
                    aborted = true;
                    break;
                }
                // Completed flags are permanent: a duplicate entry in the
                // order is skipped, never re-run
                if self.run_lock().is_completed(phase) {
                    continue;
                }
                let outcome = match phase {
                    Phase::Ping => self.run_ping_phase().await,
                    Phase::Download => self.run_transfer_phase(TransferDirection::Download).await,
                    Phase::Upload => self.run_transfer_phase(TransferDirection::Upload).await,
                    // Validation rejects non-schedulable phases in the order
                    _ => PhaseOutcome::Completed,
                };
                if outcome == PhaseOutcome::Aborted {
                    aborted = true;
                    break;
                }
            }
        }

        let result = self.run_lock().finalize(aborted);
        self.emit_update();
        if !self.end_fired.swap(true, Ordering::SeqCst) {
            if let Some(callback) = &self.on_end {
                callback(aborted);
            }
        }
        self.logger.info(
            "orchestrator",
            &format!("run {} ({})", if aborted { "aborted" } else { "finished" }, result.run_id),
        );
        result
    }

    fn run_lock(&self) -> MutexGuard<'_, TestRun> {
        // A worker panic cannot leave the counters half-updated; recover
        // the guard instead of propagating the poison
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_update(&self) {
        if let Some(callback) = &self.on_update {
            callback(self.run_lock().snapshot());
        }
    }

    /// Run one throughput phase with a saturated pool of `streams` workers
    async fn run_transfer_phase(&self, direction: TransferDirection) -> PhaseOutcome {
        let (url, streams, budget, bias) = match direction {
            TransferDirection::Download => (
                self.config.download_url.clone().unwrap_or_default(),
                self.config.streams_dl,
                self.config.time_dl_max(),
                self.config.download_bias,
            ),
            TransferDirection::Upload => (
                self.config.upload_url.clone().unwrap_or_default(),
                self.config.streams_ul,
                self.config.time_ul_max(),
                self.config.upload_bias,
            ),
        };
        let scale = self.config.speed_scale();
        let tolerate = self.config.tolerate_errors;

        // The upload payload is generated once per phase and shared
        // read-only by every stream; requests reuse it bit-for-bit
        let payload = match direction {
            TransferDirection::Upload => {
                Some(generate_upload_payload(self.config.upload_payload_bytes))
            }
            TransferDirection::Download => None,
        };

        let generation = self.run_lock().begin_phase(direction.phase());
        self.logger.info(
            "orchestrator",
            &format!("{} phase started ({} streams)", direction.phase().name(), streams),
        );

        let phase_started = std::time::Instant::now();
        let deadline = TokioInstant::now() + budget;
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<crate::error::AppError>();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(streams as usize);
        for _ in 0..streams {
            let job = match (&payload, direction) {
                (Some(payload), TransferDirection::Upload) => WorkerJob::Upload {
                    url: url.clone(),
                    payload: payload.clone(),
                },
                _ => WorkerJob::Download { url: url.clone() },
            };
            workers.push(tokio::spawn(pool_worker(
                Arc::clone(&self.backend),
                job,
                progress_tx.clone(),
                error_tx.clone(),
                cancel_rx.clone(),
                tolerate,
            )));
        }
        drop(progress_tx);
        drop(error_tx);

        let mut detector =
            StabilityDetector::new(self.config.stable_threshold, self.config.min_stable());
        let mut ticker = interval(self.config.update_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut progress_open = true;
        let mut errors_open = true;
        let outcome = loop {
            tokio::select! {
                _ = self.abort.cancelled() => break PhaseOutcome::Aborted,
                _ = sleep_until(deadline) => break PhaseOutcome::Completed,
                delta = progress_rx.recv(), if progress_open => match delta {
                    Some(delta) => {
                        self.run_lock().apply_bytes(direction, generation, delta);
                    }
                    None => {
                        progress_open = false;
                        if !errors_open {
                            // Every worker stopped; nothing more can arrive
                            break PhaseOutcome::Completed;
                        }
                    }
                },
                error = error_rx.recv(), if errors_open => match error {
                    Some(error) => {
                        self.run_lock().record_transfer_error(direction, generation);
                        self.logger
                            .debug("transfer", &format!("{} error: {}", direction.phase().name(), error));
                    }
                    None => {
                        errors_open = false;
                        if !progress_open {
                            break PhaseOutcome::Completed;
                        }
                    }
                },
                _ = ticker.tick() => {
                    let now = std::time::Instant::now();
                    let elapsed = now.duration_since(phase_started);
                    let raw_speed = {
                        let mut run = self.run_lock();
                        let bytes = run.transfer_bytes(direction);
                        let raw = throughput_mbps(bytes, elapsed, scale);
                        run.set_throughput(direction, generation, raw * bias, elapsed);
                        run.set_phase_progress(
                            direction.phase(),
                            generation,
                            elapsed.as_secs_f64() / budget.as_secs_f64(),
                        );
                        raw
                    };
                    self.emit_update();
                    if detector.observe(raw_speed, now) {
                        self.logger.debug(
                            "orchestrator",
                            &format!("{} speed stabilized, ending phase early", direction.phase().name()),
                        );
                        break PhaseOutcome::Completed;
                    }
                }
            }
        };

        // Stop the pool before sealing the phase; the completed flag and
        // generation guard drop anything still in flight
        let _ = cancel_tx.send(true);
        // Deltas already queued at completion belong to the phase window;
        // apply them so the sealed byte total is exact
        while let Ok(delta) = progress_rx.try_recv() {
            self.run_lock().apply_bytes(direction, generation, delta);
        }
        if outcome == PhaseOutcome::Completed {
            let elapsed = phase_started.elapsed();
            let mut run = self.run_lock();
            run.complete_transfer_phase(direction, generation, elapsed, scale, bias);
            let errors = run.transfer_errors(direction);
            drop(run);
            if errors > 0 {
                self.logger.warn(
                    "orchestrator",
                    &format!("{} phase saw {} transfer errors", direction.phase().name(), errors),
                );
            }
            self.emit_update();
        }
        progress_rx.close();
        error_rx.close();
        for mut worker in workers {
            if tokio::time::timeout(WORKER_GRACE, &mut worker).await.is_err() {
                worker.abort();
            }
        }
        outcome
    }

    /// Run the latency phase: sequential probes, aggregated incrementally
    async fn run_ping_phase(&self) -> PhaseOutcome {
        let url = self.config.ping_url.clone().unwrap_or_default();
        let count = self.config.count_ping;
        let tolerate = self.config.tolerate_errors;

        let generation = self.run_lock().begin_phase(Phase::Ping);
        self.logger.info(
            "orchestrator",
            &format!("ping phase started ({} probes)", count),
        );

        let deadline = TokioInstant::now() + self.config.time_ping_max();
        let mut ticker = interval(self.config.update_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut samples: Vec<f64> = Vec::new();
        let mut aborted = false;
        'probes: while (samples.len() as u32) < count {
            let probe = self.backend.probe(&url);
            tokio::pin!(probe);
            loop {
                tokio::select! {
                    _ = self.abort.cancelled() => {
                        aborted = true;
                        break 'probes;
                    }
                    _ = sleep_until(deadline) => break 'probes,
                    _ = ticker.tick() => self.emit_update(),
                    result = &mut probe => {
                        match result {
                            Ok(rtt_ms) => {
                                samples.push(rtt_ms);
                                if let Some(stats) = aggregate_latency(
                                    &samples,
                                    self.config.ping_trim_fraction,
                                    self.config.ping_bias,
                                    self.config.jitter_bias,
                                ) {
                                    let mut run = self.run_lock();
                                    run.set_latency(generation, &stats);
                                    run.set_phase_progress(
                                        Phase::Ping,
                                        generation,
                                        samples.len() as f64 / count as f64,
                                    );
                                }
                            }
                            Err(error) => {
                                self.run_lock().record_ping_failure(generation);
                                self.logger.debug("ping", &format!("probe failed: {}", error));
                                if !tolerate {
                                    break 'probes;
                                }
                                tokio::time::sleep(RETRY_DELAY).await;
                            }
                        }
                        break;
                    }
                }
            }
        }

        if aborted {
            return PhaseOutcome::Aborted;
        }

        let stats = aggregate_latency(
            &samples,
            self.config.ping_trim_fraction,
            self.config.ping_bias,
            self.config.jitter_bias,
        );
        if stats.is_none() {
            self.logger
                .warn("orchestrator", "ping phase collected no successful samples");
        }
        self.run_lock().complete_ping_phase(generation, stats.as_ref());
        self.emit_update();
        PhaseOutcome::Completed
    }
}

/// One pool worker: keeps exactly one transfer in flight, starting the
/// next as soon as the previous completes, until the phase cancels it
async fn pool_worker(
    backend: Arc<dyn TransferBackend>,
    job: WorkerJob,
    progress: mpsc::UnboundedSender<u64>,
    errors: mpsc::UnboundedSender<crate::error::AppError>,
    cancel: watch::Receiver<bool>,
    tolerate: bool,
) {
    loop {
        if *cancel.borrow() {
            break;
        }
        let result = match &job {
            WorkerJob::Download { url } => {
                backend.download(url, progress.clone(), cancel.clone()).await
            }
            WorkerJob::Upload { url, payload } => {
                backend
                    .upload(url, payload.clone(), progress.clone(), cancel.clone())
                    .await
            }
        };
        match result {
            Ok(_) => {}
            Err(error) => {
                if errors.send(error).is_err() {
                    break;
                }
                if !tolerate {
                    break;
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Generate the shared upload payload for one upload phase
fn generate_upload_payload(len: usize) -> Bytes {
    let mut buffer = vec![0u8; len];
    rand::rng().fill_bytes(&mut buffer);
    Bytes::from(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::result::MetricReading;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Duration;

    /// Synthetic transport with controllable pacing and failure modes
    struct MockBackend {
        /// Bytes per progress chunk (doubled per chunk when `growing`)
        chunk_bytes: AtomicU64,
        /// Chunks reported per transfer
        chunks_per_transfer: u32,
        /// Pacing delay between chunks
        chunk_delay: Duration,
        /// Every transfer fails after a short delay
        failing: bool,
        /// Chunk size doubles on every chunk (defeats stabilization)
        growing: bool,
        /// Synthetic probe round-trip
        probe_rtt_ms: f64,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl MockBackend {
        fn steady(chunk_bytes: u64) -> Self {
            Self {
                chunk_bytes: AtomicU64::new(chunk_bytes),
                chunks_per_transfer: 10,
                chunk_delay: Duration::from_millis(20),
                failing: false,
                growing: false,
                probe_rtt_ms: 15.0,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                failing: true,
                ..Self::steady(1000)
            }
        }

        fn growing() -> Self {
            Self {
                growing: true,
                ..Self::steady(1000)
            }
        }

        async fn transfer(
            &self,
            progress: mpsc::UnboundedSender<u64>,
            cancel: watch::Receiver<bool>,
        ) -> crate::error::Result<u64> {
            if self.failing {
                tokio::time::sleep(Duration::from_millis(5)).await;
                return Err(AppError::network("synthetic transfer failure"));
            }
            let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(current, Ordering::SeqCst);

            let mut total = 0u64;
            for _ in 0..self.chunks_per_transfer {
                if *cancel.borrow() {
                    break;
                }
                tokio::time::sleep(self.chunk_delay).await;
                let size = if self.growing {
                    let size = self.chunk_bytes.load(Ordering::SeqCst);
                    // Cap keeps byte totals far from u64 overflow
                    self.chunk_bytes
                        .store(size.saturating_mul(2).min(1 << 45), Ordering::SeqCst);
                    size
                } else {
                    self.chunk_bytes.load(Ordering::SeqCst)
                };
                total += size;
                if progress.send(size).is_err() {
                    break;
                }
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(total)
        }
    }

    #[async_trait]
    impl TransferBackend for MockBackend {
        async fn download(
            &self,
            _url: &str,
            progress: mpsc::UnboundedSender<u64>,
            cancel: watch::Receiver<bool>,
        ) -> crate::error::Result<u64> {
            self.transfer(progress, cancel).await
        }

        async fn upload(
            &self,
            _url: &str,
            _payload: Bytes,
            progress: mpsc::UnboundedSender<u64>,
            cancel: watch::Receiver<bool>,
        ) -> crate::error::Result<u64> {
            self.transfer(progress, cancel).await
        }

        async fn probe(&self, _url: &str) -> crate::error::Result<f64> {
            if self.failing {
                tokio::time::sleep(Duration::from_millis(2)).await;
                return Err(AppError::network("synthetic probe failure"));
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(self.probe_rtt_ms)
        }
    }

    fn base_config() -> Config {
        Config {
            download_url: Some("http://test.invalid/garbage".to_string()),
            upload_url: Some("http://test.invalid/empty".to_string()),
            ping_url: Some("http://test.invalid/empty".to_string()),
            time_dl_max_secs: 2,
            time_ul_max_secs: 2,
            time_ping_max_secs: 2,
            count_ping: 3,
            streams_dl: 4,
            streams_ul: 2,
            min_stable_secs: 0.4,
            update_interval_ms: 50,
            upload_payload_bytes: 64 * 1024,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_full_run_reaches_finished_with_all_metrics() {
        let mock = Arc::new(MockBackend::steady(100_000));
        let updates = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(AtomicUsize::new(0));
        let updates_clone = Arc::clone(&updates);
        let ends_clone = Arc::clone(&ends);

        let test = SpeedTest::with_backend(base_config(), mock)
            .unwrap()
            .on_update(move |_| {
                updates_clone.fetch_add(1, Ordering::SeqCst);
            })
            .on_end(move |aborted| {
                assert!(!aborted);
                ends_clone.fetch_add(1, Ordering::SeqCst);
            });

        let result = test.start().await;
        assert!(!result.aborted);
        assert!(result.is_complete());
        assert!(result.ping.is_measured());
        assert!(result.jitter.is_measured());
        assert!(result.download.is_measured());
        assert!(result.upload.is_measured());
        assert!(result.download_bytes > 0);
        assert!(result.upload_bytes > 0);
        // 3 raw probes, trim fraction 0.2 -> worst one dropped
        assert_eq!(result.ping_samples, 2);
        assert!(updates.load(Ordering::SeqCst) > 0);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(test.snapshot().phase, Phase::Finished);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_configured_streams() {
        let mock = Arc::new(MockBackend::steady(50_000));
        let mut config = base_config();
        config.test_order = vec![Phase::Download];
        config.time_dl_max_secs = 1;
        // Keep the phase running for the whole budget
        config.stable_threshold = 0.001;
        config.min_stable_secs = 30.0;

        let test = SpeedTest::with_backend(config, mock.clone()).unwrap();
        let result = test.start().await;

        assert!(!result.aborted);
        assert_eq!(mock.max_active.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_stabilized_phase_ends_before_budget() {
        let mock = Arc::new(MockBackend::steady(100_000));
        let mut config = base_config();
        config.test_order = vec![Phase::Download];
        config.time_dl_max_secs = 15;

        let test = SpeedTest::with_backend(config, mock).unwrap();
        let started = std::time::Instant::now();
        let result = test.start().await;
        let elapsed = started.elapsed();

        assert!(result.download.is_measured());
        assert!(
            elapsed < Duration::from_secs(5),
            "stabilization should end the phase early, took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_never_stabilizing_phase_runs_to_budget() {
        let mock = Arc::new(MockBackend::growing());
        let mut config = base_config();
        config.test_order = vec![Phase::Download];
        config.time_dl_max_secs = 1;
        config.streams_dl = 1;
        config.min_stable_secs = 0.3;

        let test = SpeedTest::with_backend(config, mock).unwrap();
        let started = std::time::Instant::now();
        let result = test.start().await;
        let elapsed = started.elapsed();

        assert!(!result.aborted);
        assert!(result.download.is_measured());
        assert!(
            elapsed >= Duration::from_millis(950),
            "a non-converging signal must run out the budget, took {:?}",
            elapsed
        );
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_all_transfers_failing_degrades_not_aborts() {
        let mock = Arc::new(MockBackend::failing());
        let mut config = base_config();
        config.test_order = vec![Phase::Download];
        config.time_dl_max_secs = 1;

        let started = std::time::Instant::now();
        let test = SpeedTest::with_backend(config, mock).unwrap();
        let result = test.start().await;
        let elapsed = started.elapsed();

        assert!(!result.aborted, "degradation must not abort the run");
        assert!(result.is_complete());
        assert_eq!(result.download, MetricReading::Unmeasured);
        assert_eq!(result.download_bytes, 0);
        assert_eq!(test.snapshot().phase, Phase::Finished);
        // Tolerant retries keep going until the budget expires
        assert!(elapsed >= Duration::from_millis(950));
    }

    #[tokio::test]
    async fn test_all_probes_failing_degrades_ping() {
        let mock = Arc::new(MockBackend::failing());
        let mut config = base_config();
        config.test_order = vec![Phase::Ping];
        config.time_ping_max_secs = 1;

        let test = SpeedTest::with_backend(config, mock).unwrap();
        let result = test.start().await;

        assert!(!result.aborted);
        assert_eq!(result.ping, MetricReading::Unmeasured);
        assert_eq!(result.jitter, MetricReading::Unmeasured);
        assert_eq!(result.ping_samples, 0);
    }

    #[tokio::test]
    async fn test_abort_immediately_after_start() {
        let mock = Arc::new(MockBackend::steady(50_000));
        let ends = Arc::new(AtomicUsize::new(0));
        let ends_clone = Arc::clone(&ends);

        let test = SpeedTest::with_backend(base_config(), mock)
            .unwrap()
            .on_end(move |aborted| {
                assert!(aborted);
                ends_clone.fetch_add(1, Ordering::SeqCst);
            });

        let runner = test.clone();
        let task = tokio::spawn(async move { runner.start().await });
        test.abort();
        let result = task.await.unwrap();

        assert!(result.aborted);
        assert_eq!(result.download_bytes, 0);
        assert_eq!(test.snapshot().phase, Phase::Aborted);
        assert_eq!(ends.load(Ordering::SeqCst), 1);

        // Idempotent: a second abort changes nothing and fires nothing
        test.abort();
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_mid_phase_cancels_workers() {
        let mock = Arc::new(MockBackend::steady(50_000));
        let mut config = base_config();
        config.test_order = vec![Phase::Download];
        config.time_dl_max_secs = 30;
        config.stable_threshold = 0.001;
        config.min_stable_secs = 60.0;

        let test = SpeedTest::with_backend(config, mock.clone()).unwrap();
        let runner = test.clone();
        let task = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        test.abort();
        let result = task.await.unwrap();

        assert!(result.aborted);
        // Partial progress is retained, not rolled back
        assert!(result.download_bytes > 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.active.load(Ordering::SeqCst), 0, "workers must be cancelled");
    }

    #[tokio::test]
    async fn test_results_query_is_available_mid_run() {
        let mock = Arc::new(MockBackend::steady(50_000));
        let mut config = base_config();
        config.test_order = vec![Phase::Download];
        config.time_dl_max_secs = 30;
        config.stable_threshold = 0.001;
        config.min_stable_secs = 60.0;

        let test = SpeedTest::with_backend(config, mock).unwrap();
        let runner = test.clone();
        let task = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(400)).await;
        let partial = test.results();
        assert!(!partial.is_complete());
        assert!(partial.download_bytes > 0);

        test.abort();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_fast_download_ends_phase_early() {
        let mock = Arc::new(MockBackend::failing());
        let mut config = base_config();
        config.test_order = vec![Phase::Download];
        config.time_dl_max_secs = 10;
        config.tolerate_errors = false;

        let started = std::time::Instant::now();
        let test = SpeedTest::with_backend(config, mock).unwrap();
        let result = test.start().await;
        let elapsed = started.elapsed();

        // Every worker died on its first transfer; the phase ends well
        // before the budget and the metric degrades
        assert!(!result.aborted);
        assert_eq!(result.download, MetricReading::Unmeasured);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let mock = Arc::new(MockBackend::steady(1000));
        let mut config = base_config();
        config.streams_dl = 0;
        let error = SpeedTest::with_backend(config, mock).unwrap_err();
        assert_eq!(error.category(), "CONFIG");
    }
}
