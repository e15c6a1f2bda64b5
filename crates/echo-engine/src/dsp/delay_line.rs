/// Fixed-capacity circular buffer of 16-bit samples holding the echo memory.
///
/// Capacity is chosen once from the sample rate and the largest supported
/// delay; changing the delay only moves the read offset, never the size.
/// Owned by the processing loop alone, so there is no locking.
pub struct RingDelayLine {
    buf: Box<[i16]>,
}

impl RingDelayLine {
    /// Allocates a silent line of `capacity` samples (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0i16; capacity.max(1)].into_boxed_slice() }
    }

    /// Capacity for `max_delay_seconds` of history at `sample_rate`.
    pub fn for_max_delay(sample_rate: u32, max_delay_seconds: f32) -> Self {
        let secs = if max_delay_seconds.is_finite() { max_delay_seconds.max(0.0) } else { 0.0 };
        let cap = (sample_rate as f64 * secs as f64).ceil() as usize;
        Self::with_capacity(cap)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Stores `sample` at `index`, wrapped into `[0, size)`.
    #[inline]
    pub fn write(&mut self, index: usize, sample: i16) {
        let cap = self.buf.len();
        self.buf[index % cap] = sample;
    }

    /// Reads the sample at `index`, wrapped into `[0, size)`.
    #[inline]
    pub fn read(&self, index: usize) -> i16 {
        self.buf[index % self.buf.len()]
    }

    /// Position `delay` samples behind `index`. `delay` must not exceed `size()`.
    #[inline]
    pub fn index_behind(&self, index: usize, delay: usize) -> usize {
        let cap = self.buf.len();
        (index % cap + cap - delay) % cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_from_rate_and_max_delay() {
        let line = RingDelayLine::for_max_delay(44_100, 2.0);
        assert_eq!(line.size(), 88_200);
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        assert_eq!(RingDelayLine::with_capacity(0).size(), 1);
        assert_eq!(RingDelayLine::for_max_delay(44_100, f32::NAN).size(), 1);
    }

    #[test]
    fn write_and_read_wrap_modulo_capacity() {
        let mut line = RingDelayLine::with_capacity(4);
        line.write(6, 42);
        assert_eq!(line.read(2), 42);
        assert_eq!(line.read(10), 42);
    }

    #[test]
    fn indices_stay_in_range() {
        let mut line = RingDelayLine::with_capacity(7);
        for i in 0..100usize {
            line.write(i, i as i16);
            for delay in 0..=7 {
                let r = line.index_behind(i, delay);
                assert!(r < line.size(), "read index {r} out of range");
            }
        }
    }

    #[test]
    fn index_behind_reaches_back_delay_samples() {
        let line = RingDelayLine::with_capacity(100);
        assert_eq!(line.index_behind(5, 10), 95);
        assert_eq!(line.index_behind(50, 10), 40);
        // a full-capacity delay lands on the slot about to be overwritten
        assert_eq!(line.index_behind(5, 100), 5);
    }
}
