use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;

#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for message ids and reconnect jitter. Methods are static so that
///  components can be generic over `R: Random` without carrying an instance around, which
///  allows replacing randomness with deterministic values in tests.
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    fn fill_bytes(buf: &mut [u8]);
    fn gen_f64_range(range: Range<f64>) -> f64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn fill_bytes(buf: &mut [u8]) {
        rand::rng().fill(buf);
    }

    fn gen_f64_range(range: Range<f64>) -> f64 {
        if range.is_empty() {
            return range.start;
        }
        rand::rng().random_range(range)
    }
}
