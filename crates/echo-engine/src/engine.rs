//! Session lifecycle: one worker thread per session owns both devices, the
//! delay line and the block buffer; the caller only flips flags.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::devices::{AudioCaptureSource, AudioPlaybackSink, DeviceBackend, EchoCanceller, StreamFormat};
use crate::dsp::EchoProcessor;
use crate::error::{DeviceError, DeviceRole, SessionExit};
use crate::params::EffectParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
}

/// Counters accumulated over the controller's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub sessions: u64,
    pub blocks_processed: u64,
    pub samples_processed: u64,
    pub transient_errors: u64,
    /// Input samples the capture device dropped because the loop fell behind.
    pub overruns: u64,
}

struct Shared {
    running: AtomicBool,
    stop_requested: AtomicBool,
    // serializes start/stop against the worker's final Idle transition
    control: Mutex<()>,
    state_changed: Condvar,
    last_exit: Mutex<Option<SessionExit>>,
    sessions: AtomicU64,
    blocks_processed: AtomicU64,
    samples_processed: AtomicU64,
    transient_errors: AtomicU64,
    overruns: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            control: Mutex::new(()),
            state_changed: Condvar::new(),
            last_exit: Mutex::new(None),
            sessions: AtomicU64::new(0),
            blocks_processed: AtomicU64::new(0),
            samples_processed: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    fn keep_going(&self) -> bool {
        !self.stop_requested.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst)
    }

    /// Last step of every session: publish Idle.
    fn finish(&self, exit: SessionExit) {
        *self.last_exit.lock() = Some(exit);
        let _g = self.control.lock();
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.state_changed.notify_all();
        tracing::debug!("session finished, state set to idle");
    }
}

/// Real-time echo engine: capture -> echo -> playback on a dedicated worker.
///
/// `start()` and `stop()` are fire-and-forget. Session failures never reach
/// the caller; they show up as [`is_running`](Self::is_running) returning to
/// `false`, a log entry, and [`last_exit`](Self::last_exit).
///
/// ```
/// use echo_engine::devices::MockBackend;
/// use echo_engine::{EngineConfig, EngineController, EngineState};
/// use std::time::Duration;
///
/// let backend = MockBackend::new(441);
/// let engine = EngineController::new(backend.clone(), EngineConfig::default());
/// engine.start();
/// engine.params().set_decay(0.25);
/// assert!(backend.wait_for_output(4410, Duration::from_secs(5)));
/// engine.stop();
/// assert!(engine.wait_for_state(EngineState::Idle, Duration::from_secs(5)));
/// ```
pub struct EngineController {
    backend: Arc<dyn DeviceBackend>,
    cfg: EngineConfig,
    params: Arc<EffectParameters>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EngineController {
    pub fn new(backend: impl DeviceBackend + 'static, cfg: EngineConfig) -> Self {
        Self::with_backend(Arc::new(backend), cfg)
    }

    pub fn with_backend(backend: Arc<dyn DeviceBackend>, cfg: EngineConfig) -> Self {
        let params = Arc::new(EffectParameters::new(cfg.initial));
        Self {
            backend,
            cfg,
            params,
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Live parameters; writes are picked up at the next block.
    pub fn params(&self) -> &Arc<EffectParameters> {
        &self.params
    }

    /// Begins a session. No-op while a session is running (or still
    /// releasing its devices).
    ///
    /// The running flag flips before the worker exists, so observers see
    /// "starting" as running and two back-to-back calls spawn one worker.
    pub fn start(&self) {
        let _g = self.shared.control.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            tracing::debug!("engine already running, skipping start");
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.sessions.fetch_add(1, Ordering::Relaxed);
        self.shared.state_changed.notify_all();

        let mut slot = self.worker.lock();
        // the previous worker has already published Idle; reap it
        if let Some(old) = slot.take() {
            let _ = old.join();
        }

        let backend = self.backend.clone();
        let cfg = self.cfg.clone();
        let params = self.params.clone();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("echo-engine".into())
            .spawn(move || run_session(&*backend, &cfg, &params, &shared));

        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => {
                tracing::error!("failed to spawn engine worker: {e}");
                *self.shared.last_exit.lock() = Some(SessionExit::UnexpectedFault(e.to_string()));
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.state_changed.notify_all();
            }
        }
    }

    /// Asks the worker to end the session at its next block boundary.
    /// Returns immediately; no-op when idle.
    pub fn stop(&self) {
        let _g = self.shared.control.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.stop_requested.store(true, Ordering::SeqCst);
            tracing::debug!("stop signal sent to engine");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> EngineState {
        if self.is_running() { EngineState::Running } else { EngineState::Idle }
    }

    /// Blocks until the engine reaches `want` or `timeout` passes.
    pub fn wait_for_state(&self, want: EngineState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.control.lock();
        while self.state() != want {
            if self.shared.state_changed.wait_until(&mut guard, deadline).timed_out() {
                return self.state() == want;
            }
        }
        true
    }

    /// Stops the session and waits for its worker to exit.
    pub fn shutdown(&self) {
        self.stop();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("engine worker panicked");
            }
        }
    }

    /// How the most recent session ended, if any has.
    pub fn last_exit(&self) -> Option<SessionExit> {
        self.shared.last_exit.lock().clone()
    }

    pub fn stats(&self) -> SessionStats {
        let s = &self.shared;
        SessionStats {
            sessions: s.sessions.load(Ordering::Relaxed),
            blocks_processed: s.blocks_processed.load(Ordering::Relaxed),
            samples_processed: s.samples_processed.load(Ordering::Relaxed),
            transient_errors: s.transient_errors.load(Ordering::Relaxed),
            overruns: s.overruns.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/* ---------- worker side ---------- */

/// Device handles of one session. Dropping releases whatever was acquired.
#[derive(Default)]
struct SessionDevices {
    capture: Option<Box<dyn AudioCaptureSource>>,
    playback: Option<Box<dyn AudioPlaybackSink>>,
    echo_canceller: Option<Box<dyn EchoCanceller>>,
}

impl Drop for SessionDevices {
    fn drop(&mut self) {
        if let Some(mut cap) = self.capture.take() {
            if cap.is_active() {
                if let Err(e) = cap.stop() {
                    tracing::warn!("stopping capture: {e}");
                }
            }
            cap.close();
        }
        if let Some(mut play) = self.playback.take() {
            if play.is_active() {
                if let Err(e) = play.stop() {
                    tracing::warn!("stopping playback: {e}");
                }
            }
            play.close();
        }
        if let Some(mut aec) = self.echo_canceller.take() {
            aec.release();
        }
        tracing::debug!("session devices released");
    }
}

/// Publishes Idle when dropped, after everything declared later is gone.
struct FinishGuard<'a> {
    shared: &'a Shared,
    exit: Option<SessionExit>,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        let exit = self
            .exit
            .take()
            .unwrap_or_else(|| SessionExit::UnexpectedFault("worker panicked during cleanup".into()));
        self.shared.finish(exit);
    }
}

fn run_session(backend: &dyn DeviceBackend, cfg: &EngineConfig, params: &EffectParameters, shared: &Shared) {
    tracing::debug!("engine worker started");
    // declaration order is release order in reverse: devices go first
    let mut finish = FinishGuard { shared, exit: None };
    let mut devices = SessionDevices::default();

    let exit = match panic::catch_unwind(AssertUnwindSafe(|| {
        session_loop(backend, cfg, params, shared, &mut devices)
    })) {
        Ok(exit) => exit,
        Err(payload) => SessionExit::UnexpectedFault(panic_message(payload.as_ref())),
    };

    match &exit {
        SessionExit::Stopped => tracing::info!("echo session stopped"),
        SessionExit::DeviceInitialization(e) => tracing::error!("echo session not started: {e}"),
        other => tracing::error!("echo session aborted: {other}"),
    }

    drop(devices);
    finish.exit = Some(exit);
}

fn session_loop(
    backend: &dyn DeviceBackend,
    cfg: &EngineConfig,
    params: &EffectParameters,
    shared: &Shared,
    devices: &mut SessionDevices,
) -> SessionExit {
    let format = StreamFormat::mono_i16(cfg.sample_rate);

    let block = match cfg.block_frames.map_or_else(|| backend.min_block_frames(&format), Ok) {
        Ok(0) => {
            return SessionExit::DeviceInitialization(DeviceError::init(
                DeviceRole::Capture,
                "invalid minimum buffer size",
            ))
        }
        Ok(n) => n,
        Err(e) => return SessionExit::DeviceInitialization(e),
    };

    let capture = match backend.open_capture(&format, block) {
        Ok(c) => devices.capture.insert(c),
        Err(e) => return SessionExit::DeviceInitialization(e),
    };

    let mut echo = EchoProcessor::new(cfg.sample_rate, cfg.delay_line_seconds());

    let playback = match backend.open_playback(&format, block) {
        Ok(p) => devices.playback.insert(p),
        Err(e) => return SessionExit::DeviceInitialization(e),
    };

    if cfg.hardware_echo_cancellation {
        match backend.open_echo_canceller() {
            Ok(Some(aec)) => {
                devices.echo_canceller = Some(aec);
                tracing::info!("hardware echo cancellation enabled");
            }
            Ok(None) => tracing::warn!("hardware echo cancellation not available on this device"),
            Err(e) => tracing::warn!("hardware echo cancellation failed: {e}"),
        }
    }

    if let Err(e) = capture.start() {
        return SessionExit::DeviceInitialization(e);
    }
    if let Err(e) = playback.start() {
        return SessionExit::DeviceInitialization(e);
    }
    tracing::info!(
        sample_rate = cfg.sample_rate,
        block,
        delay_line = echo.capacity(),
        "capture and playback started"
    );

    let mut buf = vec![0i16; block];
    // the device counts per handle; the controller counts for its lifetime
    let mut overruns_seen = 0u64;
    while shared.keep_going() {
        let n = match capture.read_block(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n.min(buf.len()),
            Err(e) if e.is_transient() => {
                tracing::warn!("skipping block: {e}");
                shared.transient_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(e) => return SessionExit::FatalIo(e),
        };

        echo.process_block(&mut buf[..n], &params.snapshot());

        match playback.write_block(&buf[..n]) {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!("dropping block: {e}");
                shared.transient_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => return SessionExit::FatalIo(e),
        }

        shared.blocks_processed.fetch_add(1, Ordering::Relaxed);
        shared.samples_processed.fetch_add(n as u64, Ordering::Relaxed);
        let overruns = capture.overruns();
        shared.overruns.fetch_add(overruns.saturating_sub(overruns_seen), Ordering::Relaxed);
        overruns_seen = overruns;
    }
    tracing::debug!("engine loop stopped");
    SessionExit::Stopped
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
