use std::sync::atomic::{AtomicU32, Ordering};

pub const DEFAULT_VOLUME: f32 = 1.0;
pub const DEFAULT_DELAY_SECONDS: f32 = 0.5;
pub const DEFAULT_DECAY: f32 = 0.4;

/// Live-mutable echo settings shared between the control thread and the worker.
///
/// Each field is an independent atomic holding `f32` bits; readers get no
/// cross-field consistency, only a torn-free value per field. Ranges are the
/// caller's business: volume `>= 0`, delay `> 0` seconds, decay in `[0, 1)`.
#[derive(Debug)]
pub struct EffectParameters {
    volume: AtomicU32,
    delay_seconds: AtomicU32,
    decay: AtomicU32,
}

/// Values read from [`EffectParameters`] at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSnapshot {
    pub volume: f32,
    pub delay_seconds: f32,
    pub decay: f32,
}

impl ParamSnapshot {
    /// Delay in whole samples, rounded, clamped to `[1, capacity]`.
    pub fn delay_samples(&self, sample_rate: u32, capacity: usize) -> usize {
        let exact = (sample_rate as f64 * self.delay_seconds as f64).round();
        // NaN and negatives saturate to 0 here, then clamp up to one sample
        (exact as usize).clamp(1, capacity.max(1))
    }
}

impl Default for ParamSnapshot {
    fn default() -> Self {
        Self { volume: DEFAULT_VOLUME, delay_seconds: DEFAULT_DELAY_SECONDS, decay: DEFAULT_DECAY }
    }
}

impl EffectParameters {
    pub fn new(initial: ParamSnapshot) -> Self {
        Self {
            volume: AtomicU32::new(initial.volume.to_bits()),
            delay_seconds: AtomicU32::new(initial.delay_seconds.to_bits()),
            decay: AtomicU32::new(initial.decay.to_bits()),
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }
    pub fn set_volume(&self, v: f32) {
        self.volume.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn delay_seconds(&self) -> f32 {
        f32::from_bits(self.delay_seconds.load(Ordering::Relaxed))
    }
    pub fn set_delay_seconds(&self, s: f32) {
        self.delay_seconds.store(s.to_bits(), Ordering::Relaxed);
    }

    pub fn decay(&self) -> f32 {
        f32::from_bits(self.decay.load(Ordering::Relaxed))
    }
    pub fn set_decay(&self, d: f32) {
        self.decay.store(d.to_bits(), Ordering::Relaxed);
    }

    /// Reads every field once. Fields may come from different writes.
    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            volume: self.volume(),
            delay_seconds: self.delay_seconds(),
            decay: self.decay(),
        }
    }
}

impl Default for EffectParameters {
    fn default() -> Self {
        Self::new(ParamSnapshot::default())
    }
}
