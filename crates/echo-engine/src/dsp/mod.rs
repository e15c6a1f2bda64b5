pub mod delay_line;
pub mod echo;

pub use delay_line::RingDelayLine;
pub use echo::EchoProcessor;

/// Saturates to the signed 16-bit range, truncating toward zero.
#[inline]
pub fn clip16(x: f32) -> i16 {
    if x >= i16::MAX as f32 {
        i16::MAX
    } else if x <= i16::MIN as f32 {
        i16::MIN
    } else if x.is_nan() {
        0
    } else {
        x as i16
    }
}
