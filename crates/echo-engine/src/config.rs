use crate::params::ParamSnapshot;

/// Stream rate used by convention for voice effects.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
/// Longest echo the delay line is sized for.
pub const DEFAULT_MAX_DELAY_SECONDS: f32 = 2.0;
/// Upper bound on `max_delay_seconds`; larger values are capped when the
/// delay line is allocated.
pub const MAX_DELAY_LIMIT_SECONDS: f32 = 60.0;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_frames: Option<usize>,      // None = backend minimum
    pub max_delay_seconds: f32,           // sizes the delay line; longer delays clamp
    pub hardware_echo_cancellation: bool, // independent of the software echo
    pub initial: ParamSnapshot,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_frames: None,
            max_delay_seconds: DEFAULT_MAX_DELAY_SECONDS,
            hardware_echo_cancellation: false,
            initial: ParamSnapshot::default(),
        }
    }
}

impl EngineConfig {
    /// `max_delay_seconds` as the delay line is sized: never negative,
    /// never past [`MAX_DELAY_LIMIT_SECONDS`].
    pub fn delay_line_seconds(&self) -> f32 {
        self.max_delay_seconds.max(0.0).min(MAX_DELAY_LIMIT_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.block_frames, None);
        assert_eq!(cfg.max_delay_seconds, 2.0);
        assert!(!cfg.hardware_echo_cancellation);
        assert_eq!(cfg.initial.delay_seconds, 0.5);
    }

    #[test]
    fn delay_line_length_is_capped() {
        let with = |max_delay_seconds| EngineConfig { max_delay_seconds, ..EngineConfig::default() };
        assert_eq!(with(2.0).delay_line_seconds(), 2.0);
        assert_eq!(with(1e5).delay_line_seconds(), MAX_DELAY_LIMIT_SECONDS);
        assert_eq!(with(f32::INFINITY).delay_line_seconds(), MAX_DELAY_LIMIT_SECONDS);
        assert_eq!(with(-1.0).delay_line_seconds(), 0.0);
        assert_eq!(with(f32::NAN).delay_line_seconds(), 0.0);
    }
}
