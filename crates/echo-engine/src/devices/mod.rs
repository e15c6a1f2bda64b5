//! Device abstractions the session loop runs against.
//!
//! A [`DeviceBackend`] opens one capture source and one playback sink per
//! session (plus an optional hardware echo canceller). Handles are created
//! on the worker thread and never leave it, so they need not be `Send`.

pub mod cpal_backend;
pub mod mock;
mod ring;

pub use cpal_backend::{list_devices, print_devices, CpalBackend, DeviceInfo, DeviceSelector};
pub use mock::{MockBackend, MockRead};

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
}

impl ChannelLayout {
    pub fn channels(self) -> u16 {
        match self {
            Self::Mono => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit PCM.
    I16,
}

/// Format both devices of a session are opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: ChannelLayout,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    pub fn mono_i16(sample_rate: u32) -> Self {
        Self { sample_rate, channels: ChannelLayout::Mono, sample_format: SampleFormat::I16 }
    }
}

/// Input device handle.
///
/// `close()` must be safe on a handle that was never started and on one
/// that is already closed.
pub trait AudioCaptureSource {
    fn start(&mut self) -> Result<(), DeviceError>;
    /// Blocks for up to about one block; returns the number of samples written to `buf`.
    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError>;
    fn is_active(&self) -> bool;
    fn stop(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self);

    /// Samples dropped since this handle was opened because the reader
    /// fell behind.
    fn overruns(&self) -> u64 {
        0
    }
}

/// Output device handle. Same lifecycle rules as [`AudioCaptureSource`].
pub trait AudioPlaybackSink {
    fn start(&mut self) -> Result<(), DeviceError>;
    /// Blocks until the whole block has been queued for output.
    fn write_block(&mut self, buf: &[i16]) -> Result<(), DeviceError>;
    fn is_active(&self) -> bool;
    fn stop(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self);
}

/// Platform acoustic echo cancellation attached to a capture session.
pub trait EchoCanceller {
    fn release(&mut self);
}

/// Factory for the devices of one session.
pub trait DeviceBackend: Send + Sync {
    /// Smallest block (in samples) the devices accept for `format`.
    fn min_block_frames(&self, format: &StreamFormat) -> Result<usize, DeviceError>;

    fn open_capture(
        &self,
        format: &StreamFormat,
        block_frames: usize,
    ) -> Result<Box<dyn AudioCaptureSource>, DeviceError>;

    fn open_playback(
        &self,
        format: &StreamFormat,
        block_frames: usize,
    ) -> Result<Box<dyn AudioPlaybackSink>, DeviceError>;

    /// `Ok(None)` when the platform has no echo canceller.
    fn open_echo_canceller(&self) -> Result<Option<Box<dyn EchoCanceller>>, DeviceError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_i16_format() {
        let f = StreamFormat::mono_i16(44_100);
        assert_eq!(f.sample_rate, 44_100);
        assert_eq!(f.channels.channels(), 1);
        assert_eq!(f.sample_format, SampleFormat::I16);
    }
}
