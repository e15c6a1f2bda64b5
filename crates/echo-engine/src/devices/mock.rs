//! Scripted devices for testing without hardware.
//!
//! A [`MockBackend`] is a cheap handle around shared state, so a test keeps a
//! clone to feed input, inject failures and inspect what the engine played.
//!
//! ```
//! use echo_engine::devices::{MockBackend, MockRead};
//!
//! let backend = MockBackend::new(441);
//! backend.feed(&[0; 44_100]);       // one second of silence
//! backend.push(MockRead::Transient); // then one failed read
//! assert_eq!(backend.output().len(), 0);
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{AudioCaptureSource, AudioPlaybackSink, DeviceBackend, EchoCanceller, StreamFormat};
use crate::error::{DeviceError, DeviceRole};

/// One scripted outcome of a capture read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    /// Samples to hand out; split across reads if longer than the buffer.
    Block(Vec<i16>),
    /// The read fails recoverably.
    Transient,
    /// The read fails for good.
    Fatal,
    /// The read panics.
    Fault,
    /// The device reports this many input samples lost, then the read
    /// carries on with the next scripted item.
    Dropped(u64),
}

/// Lifecycle calls seen by one mock device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounts {
    pub opened: usize,
    pub started: usize,
    pub stopped: usize,
    pub closed: usize,
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    closed: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> DeviceCounts {
        DeviceCounts {
            opened: self.opened.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            stopped: self.stopped.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }
}

struct Shared {
    block_frames: usize,
    pacing: Duration,
    script: Mutex<VecDeque<MockRead>>,
    output: Mutex<Vec<i16>>,
    fail_capture_open: AtomicBool,
    fail_playback_open: AtomicBool,
    fail_next_write: AtomicBool,
    echo_canceller: AtomicBool,
    capture: Counters,
    playback: Counters,
    aec_opened: AtomicUsize,
    aec_released: AtomicUsize,
    open_handles: AtomicIsize,
}

#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl MockBackend {
    /// Devices reporting `block_frames` as their minimum block. Once the
    /// script runs out, reads return silence.
    pub fn new(block_frames: usize) -> Self {
        Self::with_pacing(block_frames, Duration::from_millis(1))
    }

    /// Like [`MockBackend::new`] but every read sleeps `pacing` first,
    /// standing in for the time a real device blocks.
    pub fn with_pacing(block_frames: usize, pacing: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                block_frames,
                pacing,
                script: Mutex::new(VecDeque::new()),
                output: Mutex::new(Vec::new()),
                fail_capture_open: AtomicBool::new(false),
                fail_playback_open: AtomicBool::new(false),
                fail_next_write: AtomicBool::new(false),
                echo_canceller: AtomicBool::new(false),
                capture: Counters::default(),
                playback: Counters::default(),
                aec_opened: AtomicUsize::new(0),
                aec_released: AtomicUsize::new(0),
                open_handles: AtomicIsize::new(0),
            }),
        }
    }

    pub fn push(&self, read: MockRead) {
        self.shared.script.lock().push_back(read);
    }

    /// Queues `samples` as block-sized reads.
    pub fn feed(&self, samples: &[i16]) {
        let mut script = self.shared.script.lock();
        for chunk in samples.chunks(self.shared.block_frames.max(1)) {
            script.push_back(MockRead::Block(chunk.to_vec()));
        }
    }

    pub fn fail_capture_open(&self, fail: bool) {
        self.shared.fail_capture_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_playback_open(&self, fail: bool) {
        self.shared.fail_playback_open.store(fail, Ordering::SeqCst);
    }

    /// The next `write_block` fails with a transient error.
    pub fn fail_next_write(&self) {
        self.shared.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub fn set_echo_canceller_available(&self, available: bool) {
        self.shared.echo_canceller.store(available, Ordering::SeqCst);
    }

    /// Everything written to playback so far.
    pub fn output(&self) -> Vec<i16> {
        self.shared.output.lock().clone()
    }

    pub fn output_len(&self) -> usize {
        self.shared.output.lock().len()
    }

    /// Polls until at least `samples` have been played.
    pub fn wait_for_output(&self, samples: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.output_len() < samples {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn capture_counts(&self) -> DeviceCounts {
        self.shared.capture.snapshot()
    }

    pub fn playback_counts(&self) -> DeviceCounts {
        self.shared.playback.snapshot()
    }

    /// (opened, released) echo canceller count.
    pub fn echo_canceller_counts(&self) -> (usize, usize) {
        (
            self.shared.aec_opened.load(Ordering::SeqCst),
            self.shared.aec_released.load(Ordering::SeqCst),
        )
    }

    /// Handles opened and not yet closed, echo canceller included.
    pub fn open_handles(&self) -> isize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }
}

impl DeviceBackend for MockBackend {
    fn min_block_frames(&self, _format: &StreamFormat) -> Result<usize, DeviceError> {
        Ok(self.shared.block_frames)
    }

    fn open_capture(
        &self,
        _format: &StreamFormat,
        _block_frames: usize,
    ) -> Result<Box<dyn AudioCaptureSource>, DeviceError> {
        if self.shared.fail_capture_open.load(Ordering::SeqCst) {
            return Err(DeviceError::init(DeviceRole::Capture, "mock capture unavailable"));
        }
        self.shared.capture.opened.fetch_add(1, Ordering::SeqCst);
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCapture {
            shared: self.shared.clone(),
            active: false,
            closed: false,
            overruns: 0,
        }))
    }

    fn open_playback(
        &self,
        _format: &StreamFormat,
        _block_frames: usize,
    ) -> Result<Box<dyn AudioPlaybackSink>, DeviceError> {
        if self.shared.fail_playback_open.load(Ordering::SeqCst) {
            return Err(DeviceError::init(DeviceRole::Playback, "mock playback unavailable"));
        }
        self.shared.playback.opened.fetch_add(1, Ordering::SeqCst);
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPlayback { shared: self.shared.clone(), active: false, closed: false }))
    }

    fn open_echo_canceller(&self) -> Result<Option<Box<dyn EchoCanceller>>, DeviceError> {
        if !self.shared.echo_canceller.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.shared.aec_opened.fetch_add(1, Ordering::SeqCst);
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(MockEchoCanceller { shared: self.shared.clone(), released: false })))
    }
}

struct MockCapture {
    shared: Arc<Shared>,
    active: bool,
    closed: bool,
    overruns: u64,
}

impl AudioCaptureSource for MockCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.shared.capture.started.fetch_add(1, Ordering::SeqCst);
        self.active = true;
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        let role = DeviceRole::Capture;
        if !self.active {
            return Err(DeviceError::fatal(role, "read on a device that is not recording"));
        }
        if !self.shared.pacing.is_zero() {
            thread::sleep(self.shared.pacing);
        }
        let next = self.shared.script.lock().pop_front();
        match next {
            None => {
                buf.fill(0);
                Ok(buf.len())
            }
            Some(MockRead::Block(mut samples)) => {
                if samples.len() > buf.len() {
                    let rest = samples.split_off(buf.len());
                    self.shared.script.lock().push_front(MockRead::Block(rest));
                }
                buf[..samples.len()].copy_from_slice(&samples);
                Ok(samples.len())
            }
            Some(MockRead::Transient) => Err(DeviceError::transient(role, "mock read error")),
            Some(MockRead::Fatal) => Err(DeviceError::fatal(role, "mock bad value")),
            Some(MockRead::Fault) => panic!("injected capture fault"),
            Some(MockRead::Dropped(n)) => {
                self.overruns += n;
                self.read_block(buf)
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.shared.capture.stopped.fetch_add(1, Ordering::SeqCst);
        self.active = false;
        Ok(())
    }

    fn close(&mut self) {
        self.active = false;
        if !std::mem::replace(&mut self.closed, true) {
            self.shared.capture.closed.fetch_add(1, Ordering::SeqCst);
            self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn overruns(&self) -> u64 {
        self.overruns
    }
}

struct MockPlayback {
    shared: Arc<Shared>,
    active: bool,
    closed: bool,
}

impl AudioPlaybackSink for MockPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.shared.playback.started.fetch_add(1, Ordering::SeqCst);
        self.active = true;
        Ok(())
    }

    fn write_block(&mut self, buf: &[i16]) -> Result<(), DeviceError> {
        let role = DeviceRole::Playback;
        if !self.active {
            return Err(DeviceError::fatal(role, "write on a device that is not playing"));
        }
        if self.shared.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::transient(role, "mock write error"));
        }
        self.shared.output.lock().extend_from_slice(buf);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.shared.playback.stopped.fetch_add(1, Ordering::SeqCst);
        self.active = false;
        Ok(())
    }

    fn close(&mut self) {
        self.active = false;
        if !std::mem::replace(&mut self.closed, true) {
            self.shared.playback.closed.fetch_add(1, Ordering::SeqCst);
            self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MockEchoCanceller {
    shared: Arc<Shared>,
    released: bool,
}

impl EchoCanceller for MockEchoCanceller {
    fn release(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.shared.aec_released.fetch_add(1, Ordering::SeqCst);
            self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> StreamFormat {
        StreamFormat::mono_i16(44_100)
    }

    #[test]
    fn reads_follow_the_script_then_go_silent() {
        let backend = MockBackend::with_pacing(4, Duration::ZERO);
        backend.feed(&[1, 2, 3, 4, 5, 6]);
        backend.push(MockRead::Transient);

        let mut cap = backend.open_capture(&format(), 4).unwrap();
        cap.start().unwrap();
        let mut buf = [9i16; 4];
        assert_eq!(cap.read_block(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(cap.read_block(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[5, 6]);
        assert!(cap.read_block(&mut buf).unwrap_err().is_transient());
        assert_eq!(cap.read_block(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn long_blocks_are_split_across_reads() {
        let backend = MockBackend::with_pacing(8, Duration::ZERO);
        backend.push(MockRead::Block(vec![7; 10]));
        let mut cap = backend.open_capture(&format(), 4).unwrap();
        cap.start().unwrap();
        let mut buf = [0i16; 4];
        assert_eq!(cap.read_block(&mut buf).unwrap(), 4);
        assert_eq!(cap.read_block(&mut buf).unwrap(), 4);
        assert_eq!(cap.read_block(&mut buf).unwrap(), 2);
    }

    #[test]
    fn dropped_samples_are_counted_per_handle() {
        let backend = MockBackend::with_pacing(4, Duration::ZERO);
        backend.push(MockRead::Dropped(30));
        backend.feed(&[1, 2, 3, 4]);
        let mut cap = backend.open_capture(&format(), 4).unwrap();
        cap.start().unwrap();
        let mut buf = [0i16; 4];
        assert_eq!(cap.read_block(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(cap.overruns(), 30);

        // a fresh handle starts from zero
        let fresh = backend.open_capture(&format(), 4).unwrap();
        assert_eq!(fresh.overruns(), 0);
    }

    #[test]
    fn read_before_start_is_fatal() {
        let backend = MockBackend::new(4);
        let mut cap = backend.open_capture(&format(), 4).unwrap();
        let mut buf = [0i16; 4];
        assert!(cap.read_block(&mut buf).unwrap_err().is_fatal());
    }

    #[test]
    fn close_is_idempotent_and_safe_unstarted() {
        let backend = MockBackend::new(4);
        let mut cap = backend.open_capture(&format(), 4).unwrap();
        let mut play = backend.open_playback(&format(), 4).unwrap();
        assert_eq!(backend.open_handles(), 2);
        cap.close();
        cap.close();
        play.close();
        play.close();
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(backend.capture_counts().closed, 1);
        assert_eq!(backend.playback_counts().closed, 1);
    }

    #[test]
    fn playback_records_and_fails_once_on_request() {
        let backend = MockBackend::new(4);
        let mut play = backend.open_playback(&format(), 4).unwrap();
        play.start().unwrap();
        play.write_block(&[1, 2]).unwrap();
        backend.fail_next_write();
        assert!(play.write_block(&[3]).unwrap_err().is_transient());
        play.write_block(&[4]).unwrap();
        assert_eq!(backend.output(), vec![1, 2, 4]);
    }

    #[test]
    fn open_failures_are_initialization_errors() {
        let backend = MockBackend::new(4);
        backend.fail_capture_open(true);
        backend.fail_playback_open(true);
        assert!(matches!(
            backend.open_capture(&format(), 4).err(),
            Some(DeviceError::InitializationFailed { role: DeviceRole::Capture, .. })
        ));
        assert!(matches!(
            backend.open_playback(&format(), 4).err(),
            Some(DeviceError::InitializationFailed { role: DeviceRole::Playback, .. })
        ));
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn echo_canceller_only_when_available() {
        let backend = MockBackend::new(4);
        assert!(backend.open_echo_canceller().unwrap().is_none());
        backend.set_echo_canceller_available(true);
        let mut aec = backend.open_echo_canceller().unwrap().unwrap();
        aec.release();
        aec.release();
        assert_eq!(backend.echo_canceller_counts(), (1, 1));
    }
}
