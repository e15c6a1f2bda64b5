//! Bridge between cpal's callback threads and the worker's blocking calls.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/* ---------- lock-free SPSC ring (power-of-two capacity) ---------- */

pub(crate) struct SpscRing {
    // Interior mutability: single producer writes, single consumer reads.
    buf: UnsafeCell<Box<[i16]>>,
    mask: usize,
    write: AtomicUsize,
    read: AtomicUsize,
}

// Safety: SPSC discipline is upheld by the owners; exactly one side pushes
// (the capture callback or the worker) and one side pops. The writer only
// touches free slots and the reader only touches filled ones.
unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

impl SpscRing {
    /// Usable capacity is `next_pow2(cap) - 1` samples.
    pub(crate) fn with_capacity(cap: usize) -> Self {
        let cap_pow2 = cap.max(2).next_power_of_two();
        Self {
            buf: UnsafeCell::new(vec![0i16; cap_pow2].into_boxed_slice()),
            mask: cap_pow2 - 1,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn len(&self, w: usize, r: usize) -> usize {
        w.wrapping_sub(r) & self.mask
    }

    pub(crate) fn available(&self) -> usize {
        self.len(self.write.load(Ordering::Acquire), self.read.load(Ordering::Acquire))
    }

    pub(crate) fn free(&self) -> usize {
        self.mask - self.available()
    }

    /// Producer: push entire slice; returns false if not enough space.
    pub(crate) fn push_slice(&self, data: &[i16]) -> bool {
        let r = self.read.load(Ordering::Acquire);
        let w = self.write.load(Ordering::Relaxed);
        let free = self.mask - self.len(w, r);
        if free < data.len() {
            return false;
        }

        // Safe because: single producer, and the free-space check keeps us
        // off indices the consumer has not released yet.
        let buf = unsafe { &mut *self.buf.get() };
        let mut wi = w;
        for &v in data {
            buf[wi & self.mask] = v;
            wi = wi.wrapping_add(1);
        }
        self.write.store(wi, Ordering::Release);
        true
    }

    /// Consumer: pop up to `out.len()` samples, returns how many were copied.
    pub(crate) fn pop_into(&self, out: &mut [i16]) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Relaxed);
        let n = self.len(w, r).min(out.len());

        // Safe because: single consumer; producer only writes beyond `w`.
        let buf = unsafe { &*self.buf.get() };
        let mut ri = r;
        for o in out[..n].iter_mut() {
            *o = buf[ri & self.mask];
            ri = ri.wrapping_add(1);
        }
        self.read.store(ri, Ordering::Release);
        n
    }
}

/* ---------- wakeup signal for the blocking side ---------- */

/// Lets a callback wake a thread blocked on the ring.
///
/// Notifications are not latched; waiters re-check their condition in short
/// slices so a missed wakeup costs at most one slice.
#[derive(Default)]
pub(crate) struct Doorbell {
    lock: Mutex<()>,
    cv: Condvar,
}

const WAIT_SLICE: Duration = Duration::from_millis(2);

impl Doorbell {
    pub(crate) fn ring(&self) {
        self.cv.notify_all();
    }

    /// Blocks until `ready()` or `timeout` elapses; returns the final `ready()`.
    pub(crate) fn wait_until(&self, timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let mut guard = self.lock.lock();
            self.cv.wait_for(&mut guard, WAIT_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let ring = SpscRing::with_capacity(1000);
        assert_eq!(ring.free(), 1023);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn push_is_all_or_nothing() {
        let ring = SpscRing::with_capacity(8);
        assert!(ring.push_slice(&[1, 2, 3, 4, 5]));
        assert!(!ring.push_slice(&[6, 7, 8]));
        assert_eq!(ring.available(), 5);
    }

    #[test]
    fn pop_returns_fifo_order_and_partial_counts() {
        let ring = SpscRing::with_capacity(8);
        ring.push_slice(&[1, 2, 3]);
        let mut out = [0i16; 5];
        assert_eq!(ring.pop_into(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(ring.pop_into(&mut out), 0);
    }

    #[test]
    fn wraps_across_the_end() {
        let ring = SpscRing::with_capacity(4);
        let mut out = [0i16; 3];
        for round in 0..10i16 {
            assert!(ring.push_slice(&[round, round + 1, round + 2]));
            assert_eq!(ring.pop_into(&mut out), 3);
            assert_eq!(out, [round, round + 1, round + 2]);
        }
    }

    #[test]
    fn doorbell_wakes_waiter() {
        let ring = Arc::new(SpscRing::with_capacity(64));
        let bell = Arc::new(Doorbell::default());
        let producer = {
            let (ring, bell) = (ring.clone(), bell.clone());
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                ring.push_slice(&[7; 16]);
                bell.ring();
            })
        };
        assert!(bell.wait_until(Duration::from_secs(2), || ring.available() >= 16));
        producer.join().unwrap();
    }

    #[test]
    fn doorbell_times_out() {
        let bell = Doorbell::default();
        let start = Instant::now();
        assert!(!bell.wait_until(Duration::from_millis(20), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
