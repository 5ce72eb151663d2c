//! Memoryless (truncated-exponential) interval timer
// (c) 2025 Ross Younger

use std::time::Duration;

use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

/// Draws waiting intervals from an exponential distribution with the given
/// mean, truncated to `[min, max]`.
///
/// Events separated by exponentially distributed intervals form a Poisson
/// process, which cannot synchronise with any cyclic behaviour of the network
/// under measurement. A fixed interval could align with such a cycle and
/// produce systematically biased samples.
#[derive(Debug)]
pub(crate) struct Memoryless {
    expected: Duration,
    min: Duration,
    max: Duration,
    rng: SmallRng,
}

impl Memoryless {
    /// Standard constructor. Requires `min <= expected <= max`.
    pub(crate) fn new(expected: Duration, min: Duration, max: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(
            min <= expected && expected <= max && !expected.is_zero(),
            "invalid memoryless timer configuration (min {min:?}, expected {expected:?}, max {max:?})"
        );
        Ok(Self {
            expected,
            min,
            max,
            rng: SmallRng::from_entropy(),
        })
    }

    /// Draws the next interval.
    fn next_interval(&mut self) -> Duration {
        let u: f64 = self.rng.gen(); // [0, 1)
        // Inverse transform sampling; 1-u is in (0, 1] so the log is finite.
        let exp = self.expected.as_secs_f64() * -f64::ln(1.0 - u);
        Duration::from_secs_f64(exp).clamp(self.min, self.max)
    }

    /// Sleeps for one freshly drawn interval.
    pub(crate) async fn wait(&mut self) {
        tokio::time::sleep(self.next_interval()).await;
    }
}

#[cfg(test)]
mod test {
    use super::Memoryless;
    use std::time::Duration;

    #[test]
    fn intervals_are_clamped() {
        let min = Duration::from_millis(10);
        let expected = Duration::from_millis(25);
        let max = Duration::from_millis(40);
        let mut t = Memoryless::new(expected, min, max).unwrap();
        for _ in 0..10_000 {
            let d = t.next_interval();
            assert!(d >= min && d <= max, "interval {d:?} out of range");
        }
    }

    #[test]
    fn mean_is_plausible() {
        // With truncation the sample mean is biased towards the centre of the
        // window, but it must land well inside it.
        let mut t = Memoryless::new(
            Duration::from_millis(250),
            Duration::from_millis(100),
            Duration::from_millis(400),
        )
        .unwrap();
        let n = 10_000u32;
        let total: Duration = (0..n).map(|_| t.next_interval()).sum();
        let mean = total / n;
        assert!(mean > Duration::from_millis(150), "mean {mean:?} too small");
        assert!(mean < Duration::from_millis(350), "mean {mean:?} too large");
    }

    #[test]
    fn invalid_config() {
        let _ = Memoryless::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
            Duration::from_millis(40),
        )
        .unwrap_err();
        let _ = Memoryless::new(Duration::ZERO, Duration::ZERO, Duration::ZERO).unwrap_err();
    }
}
