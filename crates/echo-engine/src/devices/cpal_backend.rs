use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::ring::{Doorbell, SpscRing};
use super::{AudioCaptureSource, AudioPlaybackSink, DeviceBackend, StreamFormat};
use crate::error::{DeviceError, DeviceRole};

/// Block size used when the host does not report a buffer size range.
const FALLBACK_BLOCK_FRAMES: usize = 1024;
/// Output ring holds this many blocks.
const PLAYBACK_RING_BLOCKS: usize = 8;
/// Input ring holds this many blocks before the callback starts dropping.
const CAPTURE_RING_BLOCKS: usize = 16;
/// Callback-side conversion chunk, kept on the stack.
const CONVERT_CHUNK: usize = 256;

/// One host device, numbered the way `--input-index`/`--output-index`
/// count: only devices that can capture (resp. play) get an index.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub input_index: Option<usize>,
    pub output_index: Option<usize>,
    pub is_default_input: bool,
    pub is_default_output: bool,
}

pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();

    let default_in  = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut caps = Vec::new();
    let mut names = Vec::new();
    for dev in host.devices()? {
        caps.push((can_capture(&dev), can_play(&dev)));
        names.push(dev.name().unwrap_or_else(|_| "<unknown>".to_string()));
    }

    Ok(names
        .into_iter()
        .zip(number_by_role(&caps))
        .map(|(name, (input_index, output_index))| DeviceInfo {
            is_default_input: default_in.as_deref() == Some(name.as_str()),
            is_default_output: default_out.as_deref() == Some(name.as_str()),
            name,
            input_index,
            output_index,
        })
        .collect())
}

/// Per-role running index over `(can_capture, can_play)` flags.
fn number_by_role(caps: &[(bool, bool)]) -> Vec<(Option<usize>, Option<usize>)> {
    let (mut next_in, mut next_out) = (0, 0);
    caps.iter()
        .map(|&(cap_in, cap_out)| {
            let bump = |ok: bool, next: &mut usize| {
                ok.then(|| {
                    *next += 1;
                    *next - 1
                })
            };
            (bump(cap_in, &mut next_in), bump(cap_out, &mut next_out))
        })
        .collect()
}

fn role_column(index: Option<usize>, is_default: bool) -> String {
    match index {
        Some(i) if is_default => format!("{i:>2}*"),
        Some(i) => format!("{i:>2} "),
        None => "  - ".to_string(),
    }
}

/// Pretty-print for CLI
pub fn print_devices() -> Result<()> {
    let list = list_devices()?;
    if list.is_empty() {
        println!("(no devices found)");
        return Ok(());
    }
    println!(" in  out  name   (* = default)");
    for d in &list {
        println!(
            "{} {}  {}",
            role_column(d.input_index, d.is_default_input),
            role_column(d.output_index, d.is_default_output),
            d.name
        );
    }
    Ok(())
}

/// Which host device to open: explicit index, then name substring
/// (case-insensitive), then the host default.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    pub name: Option<String>,
    pub index: Option<usize>,
}

/// Real devices through cpal's default host.
///
/// cpal delivers audio on its own callback threads; each handle bridges that
/// to blocking `read_block` / `write_block` with an SPSC ring.
#[derive(Debug, Clone)]
pub struct CpalBackend {
    input: DeviceSelector,
    output: DeviceSelector,
    io_timeout: Duration,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(DeviceSelector::default(), DeviceSelector::default())
    }
}

impl CpalBackend {
    pub fn new(input: DeviceSelector, output: DeviceSelector) -> Self {
        Self { input, output, io_timeout: Duration::from_millis(250) }
    }

    /// Longest a single read or write may block before it reports a
    /// transient error. Bounds how long `stop()` can go unnoticed.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn device(&self, want_input: bool) -> Result<cpal::Device, DeviceError> {
        let (role, sel) = if want_input {
            (DeviceRole::Capture, &self.input)
        } else {
            (DeviceRole::Playback, &self.output)
        };
        let host = cpal::default_host();
        pick_device(&host, want_input, sel.name.as_deref(), sel.index)
            .map_err(|e| DeviceError::init(role, e.to_string()))?
            .ok_or_else(|| DeviceError::init(role, "no device matched (and no default available)"))
    }
}

fn can_capture(dev: &cpal::Device) -> bool {
    dev.supported_input_configs().is_ok_and(|mut c| c.next().is_some())
}

fn can_play(dev: &cpal::Device) -> bool {
    dev.supported_output_configs().is_ok_and(|mut c| c.next().is_some())
}

fn format_rank(f: cpal::SampleFormat) -> Option<u8> {
    match f {
        cpal::SampleFormat::I16 => Some(0),
        cpal::SampleFormat::F32 => Some(1),
        cpal::SampleFormat::U16 => Some(2),
        _ => None,
    }
}

/// Picks the range to open at `rate`: fewest channels first, then the
/// device's own default format, then i16 over f32 over u16.
fn choose_config(
    ranges: &[cpal::SupportedStreamConfigRange],
    rate: u32,
    preferred: Option<cpal::SampleFormat>,
) -> Option<cpal::SupportedStreamConfig> {
    ranges
        .iter()
        .filter(|r| r.channels() > 0)
        .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
        .filter_map(|r| format_rank(r.sample_format()).map(|rank| (r, rank)))
        .min_by_key(|(r, rank)| (r.channels(), Some(r.sample_format()) != preferred, *rank))
        .map(|(r, _)| r.clone().with_sample_rate(cpal::SampleRate(rate)))
}

/// Finds a supported config for `rate` at whatever channel count the device
/// offers; the callbacks mix down to (or up from) mono.
fn negotiate(
    dev: &cpal::Device,
    role: DeviceRole,
    rate: u32,
) -> Result<cpal::SupportedStreamConfig, DeviceError> {
    let (ranges, preferred) = match role {
        DeviceRole::Capture => (
            dev.supported_input_configs().map(|c| c.collect::<Vec<_>>()),
            dev.default_input_config().ok().map(|c| c.sample_format()),
        ),
        _ => (
            dev.supported_output_configs().map(|c| c.collect::<Vec<_>>()),
            dev.default_output_config().ok().map(|c| c.sample_format()),
        ),
    };
    let ranges = ranges.map_err(|e| DeviceError::init(role, e.to_string()))?;
    choose_config(&ranges, rate, preferred).ok_or_else(|| {
        let offered: Vec<String> = ranges
            .iter()
            .map(|r| format!("{}-{} Hz", r.min_sample_rate().0, r.max_sample_rate().0))
            .collect();
        DeviceError::init(
            role,
            format!("sample rate {rate} Hz not supported (device offers {})", offered.join(", ")),
        )
    })
}

impl DeviceBackend for CpalBackend {
    fn min_block_frames(&self, _format: &StreamFormat) -> Result<usize, DeviceError> {
        let dev = self.device(true)?;
        let cfg = dev
            .default_input_config()
            .map_err(|e| DeviceError::init(DeviceRole::Capture, e.to_string()))?;
        Ok(match cfg.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => {
                let (min, max) = (*min as usize, *max as usize);
                FALLBACK_BLOCK_FRAMES.clamp(min, max.max(min))
            }
            cpal::SupportedBufferSize::Unknown => FALLBACK_BLOCK_FRAMES,
        })
    }

    fn open_capture(
        &self,
        format: &StreamFormat,
        block_frames: usize,
    ) -> Result<Box<dyn AudioCaptureSource>, DeviceError> {
        let role = DeviceRole::Capture;
        let dev = self.device(true)?;
        let native = negotiate(&dev, role, format.sample_rate)?;
        let cfg = native.config();
        let bridge = Arc::new(Bridge::new(block_frames * CAPTURE_RING_BLOCKS));

        /* --------- INPUT (format-specific) --------- */
        let stream = match native.sample_format() {
            cpal::SampleFormat::I16 => build_input::<i16>(&dev, &cfg, bridge.clone()),
            cpal::SampleFormat::F32 => build_input::<f32>(&dev, &cfg, bridge.clone()),
            cpal::SampleFormat::U16 => build_input::<u16>(&dev, &cfg, bridge.clone()),
            other => return Err(DeviceError::init(role, format!("unsupported input format: {other:?}"))),
        }
        .map_err(|e| DeviceError::init(role, e.to_string()))?;

        tracing::debug!(
            device = %dev.name().unwrap_or_default(),
            channels = cfg.channels,
            sample_format = ?native.sample_format(),
            "capture stream built"
        );
        Ok(Box::new(CpalCapture {
            stream: Some(stream),
            bridge,
            active: false,
            timeout: self.io_timeout,
        }))
    }

    fn open_playback(
        &self,
        format: &StreamFormat,
        block_frames: usize,
    ) -> Result<Box<dyn AudioPlaybackSink>, DeviceError> {
        let role = DeviceRole::Playback;
        let dev = self.device(false)?;
        let native = negotiate(&dev, role, format.sample_rate)?;
        let cfg = native.config();
        let bridge = Arc::new(Bridge::new(block_frames * PLAYBACK_RING_BLOCKS));

        /* --------- OUTPUT (format-specific) -------- */
        let stream = match native.sample_format() {
            cpal::SampleFormat::I16 => build_output::<i16>(&dev, &cfg, bridge.clone()),
            cpal::SampleFormat::F32 => build_output::<f32>(&dev, &cfg, bridge.clone()),
            cpal::SampleFormat::U16 => build_output::<u16>(&dev, &cfg, bridge.clone()),
            other => return Err(DeviceError::init(role, format!("unsupported output format: {other:?}"))),
        }
        .map_err(|e| DeviceError::init(role, e.to_string()))?;

        tracing::debug!(
            device = %dev.name().unwrap_or_default(),
            channels = cfg.channels,
            sample_format = ?native.sample_format(),
            "playback stream built"
        );
        Ok(Box::new(CpalPlayback {
            stream: Some(stream),
            bridge,
            active: false,
            timeout: self.io_timeout,
        }))
    }
}

/* ---------- callback <-> worker bridge ---------- */

struct Bridge {
    ring: SpscRing,
    bell: Doorbell,
    // set by the stream error callback when the device goes away
    fatal: Mutex<Option<String>>,
    // input samples dropped because the ring was full
    overruns: AtomicU64,
}

impl Bridge {
    fn new(capacity: usize) -> Self {
        Self {
            ring: SpscRing::with_capacity(capacity),
            bell: Doorbell::default(),
            fatal: Mutex::new(None),
            overruns: AtomicU64::new(0),
        }
    }

    fn on_stream_error(&self, role: DeviceRole, err: cpal::StreamError) {
        match err {
            cpal::StreamError::DeviceNotAvailable => {
                tracing::error!(%role, "device no longer available");
                *self.fatal.lock() = Some("device no longer available".to_string());
                self.bell.ring();
            }
            other => tracing::warn!(%role, "stream error: {other}"),
        }
    }

    fn check_fatal(&self, role: DeviceRole) -> Result<(), DeviceError> {
        match self.fatal.lock().as_ref() {
            Some(reason) => Err(DeviceError::fatal(role, reason.clone())),
            None => Ok(()),
        }
    }
}

/* ---------- channel mixing ---------- */

/// Averages each interleaved frame of `data` into one mono sample.
/// Returns the number of frames written to `out`.
fn downmix<T>(data: &[T], channels: usize, out: &mut [i16]) -> usize
where
    T: Copy,
    i16: FromSample<T>,
{
    let mut n = 0;
    for (o, frame) in out.iter_mut().zip(data.chunks_exact(channels)) {
        let sum: i32 = frame.iter().map(|&s| i16::from_sample_(s) as i32).sum();
        *o = (sum / channels as i32) as i16;
        n += 1;
    }
    n
}

/// Copies each mono sample into every channel of an interleaved frame.
fn upmix<T>(mono: &[i16], channels: usize, out: &mut [T])
where
    T: FromSample<i16>,
{
    for (frame, &s) in out.chunks_exact_mut(channels).zip(mono) {
        for o in frame {
            *o = T::from_sample_(s);
        }
    }
}

fn build_input<T>(
    dev: &cpal::Device,
    cfg: &cpal::StreamConfig,
    bridge: Arc<Bridge>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = cfg.channels.max(1) as usize;
    let err_bridge = bridge.clone();
    dev.build_input_stream::<T, _, _>(
        cfg,
        move |data: &[T], _| {
            let mut scratch = [0i16; CONVERT_CHUNK];
            for chunk in data.chunks(CONVERT_CHUNK * channels) {
                let frames = downmix(chunk, channels, &mut scratch);
                if !bridge.ring.push_slice(&scratch[..frames]) {
                    bridge.overruns.fetch_add(frames as u64, Ordering::Relaxed);
                }
            }
            bridge.bell.ring();
        },
        move |err| err_bridge.on_stream_error(DeviceRole::Capture, err),
        None,
    )
}

fn build_output<T>(
    dev: &cpal::Device,
    cfg: &cpal::StreamConfig,
    bridge: Arc<Bridge>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = cfg.channels.max(1) as usize;
    let err_bridge = bridge.clone();
    dev.build_output_stream::<T, _, _>(
        cfg,
        move |out: &mut [T], _| {
            let mut scratch = [0i16; CONVERT_CHUNK];
            for chunk in out.chunks_mut(CONVERT_CHUNK * channels) {
                let frames = chunk.len() / channels;
                let n = bridge.ring.pop_into(&mut scratch[..frames]);
                // underrun plays silence
                scratch[n..frames].fill(0);
                upmix(&scratch[..frames], channels, chunk);
            }
            bridge.bell.ring();
        },
        move |err| err_bridge.on_stream_error(DeviceRole::Playback, err),
        None,
    )
}

/* ---------- handles ---------- */

struct CpalCapture {
    stream: Option<cpal::Stream>,
    bridge: Arc<Bridge>,
    active: bool,
    timeout: Duration,
}

impl AudioCaptureSource for CpalCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| DeviceError::init(DeviceRole::Capture, "device already closed"))?;
        stream.play().map_err(|e| DeviceError::init(DeviceRole::Capture, e.to_string()))?;
        self.active = true;
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        let role = DeviceRole::Capture;
        if !self.active {
            return Err(DeviceError::fatal(role, "read on a device that is not recording"));
        }
        let bridge = &self.bridge;
        bridge.bell.wait_until(self.timeout, || {
            bridge.ring.available() >= buf.len() || bridge.fatal.lock().is_some()
        });
        bridge.check_fatal(role)?;
        match bridge.ring.pop_into(buf) {
            0 => Err(DeviceError::transient(role, format!("no input within {:?}", self.timeout))),
            n => Ok(n),
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.active = false;
        match &self.stream {
            Some(s) => s.pause().map_err(|e| DeviceError::fatal(DeviceRole::Capture, e.to_string())),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.active = false;
        // dropping the stream releases the device
        self.stream = None;
    }

    fn overruns(&self) -> u64 {
        self.bridge.overruns.load(Ordering::Relaxed)
    }
}

struct CpalPlayback {
    stream: Option<cpal::Stream>,
    bridge: Arc<Bridge>,
    active: bool,
    timeout: Duration,
}

impl AudioPlaybackSink for CpalPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| DeviceError::init(DeviceRole::Playback, "device already closed"))?;
        stream.play().map_err(|e| DeviceError::init(DeviceRole::Playback, e.to_string()))?;
        self.active = true;
        Ok(())
    }

    fn write_block(&mut self, buf: &[i16]) -> Result<(), DeviceError> {
        let role = DeviceRole::Playback;
        if !self.active {
            return Err(DeviceError::fatal(role, "write on a device that is not playing"));
        }
        let bridge = &self.bridge;
        bridge.bell.wait_until(self.timeout, || {
            bridge.ring.free() >= buf.len() || bridge.fatal.lock().is_some()
        });
        bridge.check_fatal(role)?;
        if bridge.ring.push_slice(buf) {
            Ok(())
        } else {
            Err(DeviceError::transient(role, format!("output stalled for {:?}", self.timeout)))
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.active = false;
        match &self.stream {
            Some(s) => s.pause().map_err(|e| DeviceError::fatal(DeviceRole::Playback, e.to_string())),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.active = false;
        self.stream = None;
    }
}

/* ---------- device picking (by name or index) ---------- */

fn pick_device(
    host: &cpal::Host,
    want_input: bool,
    name_substr: Option<&str>,
    index: Option<usize>,
) -> Result<Option<cpal::Device>> {
    let capable = |dev: &cpal::Device| if want_input { can_capture(dev) } else { can_play(dev) };

    // Try explicit index first
    if let Some(idx) = index {
        if let Some(dev) = host.devices()?.filter(|d| capable(d)).nth(idx) {
            return Ok(Some(dev));
        }
        tracing::warn!(idx, want_input, "device index not found, falling back");
    }

    // Then try substring match
    if let Some(q) = name_substr {
        let qn = q.to_lowercase();
        for dev in host.devices()? {
            let name = dev.name().unwrap_or_default();
            if name.to_lowercase().contains(&qn) && capable(&dev) {
                return Ok(Some(dev));
            }
        }
    }

    // Fallback to default
    Ok(if want_input { host.default_input_device() } else { host.default_output_device() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_devices_doesnt_panic() {
        // may be empty (or an error) without a sound server
        let _ = list_devices();
    }

    #[test]
    fn backend_defaults() {
        let backend = CpalBackend::default();
        assert!(backend.input.name.is_none());
        assert!(backend.output.index.is_none());
        assert_eq!(backend.io_timeout, Duration::from_millis(250));
    }

    fn range(channels: u16, min: u32, max: u32, fmt: cpal::SampleFormat) -> cpal::SupportedStreamConfigRange {
        cpal::SupportedStreamConfigRange::new(
            channels,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Unknown,
            fmt,
        )
    }

    #[test]
    fn picks_fewest_channels_at_requested_rate() {
        use cpal::SampleFormat::{F32, I16};
        let ranges = [range(2, 48_000, 48_000, F32), range(2, 8_000, 96_000, F32), range(6, 44_100, 44_100, I16)];
        let cfg = choose_config(&ranges, 44_100, Some(F32)).unwrap();
        assert_eq!(cfg.channels(), 2);
        assert_eq!(cfg.sample_rate().0, 44_100);
        assert_eq!(cfg.sample_format(), F32);

        let mono = [range(2, 44_100, 44_100, F32), range(1, 44_100, 44_100, I16)];
        assert_eq!(choose_config(&mono, 44_100, Some(F32)).unwrap().channels(), 1);
    }

    #[test]
    fn prefers_the_device_default_format() {
        use cpal::SampleFormat::{F32, I16, U8};
        let ranges = [range(2, 44_100, 48_000, I16), range(2, 44_100, 48_000, F32)];
        assert_eq!(choose_config(&ranges, 48_000, Some(F32)).unwrap().sample_format(), F32);
        assert_eq!(choose_config(&ranges, 48_000, None).unwrap().sample_format(), I16);
        // formats the callbacks can't convert are skipped
        assert!(choose_config(&[range(1, 44_100, 44_100, U8)], 44_100, Some(U8)).is_none());
    }

    #[test]
    fn unsupported_rate_finds_nothing() {
        let ranges = [range(2, 48_000, 48_000, cpal::SampleFormat::F32)];
        assert!(choose_config(&ranges, 44_100, None).is_none());
        assert!(choose_config(&[], 44_100, None).is_none());
    }

    #[test]
    fn downmix_averages_frames() {
        let stereo = [100i16, 300, -2, -4, i16::MAX, i16::MAX, 5];
        let mut out = [0i16; 8];
        // trailing half frame is ignored
        assert_eq!(downmix(&stereo, 2, &mut out), 3);
        assert_eq!(&out[..3], &[200, -3, i16::MAX]);

        let mut mono = [0i16; 2];
        assert_eq!(downmix(&[0.5f32, -1.0], 1, &mut mono), 2);
        assert_eq!(mono, [i16::from_sample_(0.5f32), i16::MIN]);
    }

    #[test]
    fn upmix_duplicates_into_every_channel() {
        let mut out = [0i16; 6];
        upmix(&[7, -8], 3, &mut out);
        assert_eq!(out, [7, 7, 7, -8, -8, -8]);

        let mut f = [1.0f32; 4];
        upmix(&[0, 0], 2, &mut f);
        assert_eq!(f, [0.0; 4]);
    }

    #[test]
    fn indices_count_per_role() {
        let caps = [(true, true), (false, true), (true, false), (false, false), (true, true)];
        assert_eq!(
            number_by_role(&caps),
            vec![
                (Some(0), Some(0)),
                (None, Some(1)),
                (Some(1), None),
                (None, None),
                (Some(2), Some(2)),
            ]
        );
        assert_eq!(role_column(Some(3), true), " 3*");
        assert_eq!(role_column(None, false), "  - ");
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn open_default_devices() {
        let backend = CpalBackend::default();
        let format = StreamFormat::mono_i16(44_100);
        let frames = backend.min_block_frames(&format).unwrap();
        let mut cap = backend.open_capture(&format, frames).unwrap();
        let mut play = backend.open_playback(&format, frames).unwrap();
        cap.start().unwrap();
        play.start().unwrap();
        let mut buf = vec![0i16; frames];
        let n = cap.read_block(&mut buf).unwrap();
        play.write_block(&buf[..n]).unwrap();
        cap.close();
        play.close();
        cap.close();
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn stereo_output_opens_at_its_native_rate() {
        // most desktop outputs only offer 2ch at 48 kHz
        let host = cpal::default_host();
        let dev = host.default_output_device().unwrap();
        let native = dev.default_output_config().unwrap();
        assert!(native.channels() >= 2, "default output is not multichannel");

        let backend = CpalBackend::default();
        let format = StreamFormat::mono_i16(native.sample_rate().0);
        let mut play = backend.open_playback(&format, 1024).unwrap();
        play.start().unwrap();
        play.write_block(&vec![0i16; 1024]).unwrap();
        play.close();
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn impossible_rate_is_an_initialization_error() {
        let backend = CpalBackend::default();
        let err = backend.open_playback(&StreamFormat::mono_i16(1), 1024).err().unwrap();
        assert!(matches!(err, DeviceError::InitializationFailed { .. }));
        assert!(err.to_string().contains("1 Hz"));
    }
}
