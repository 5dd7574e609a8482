use rand::Rng;
use std::time::Duration;

const JITTER_FACTOR: f64 = 0.5;

/// Delay before re-publishing retry N (0-indexed): `2^N` seconds plus up to
/// half of that again in jitter, so retry 0 lands in [1s, 1.5s).
pub fn backoff_delay(retry: u32) -> Duration {
    let base = 2f64.powi(retry.min(16) as i32);
    let jitter = rand::thread_rng().gen::<f64>() * base * JITTER_FACTOR;
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_ranges() {
        let cases = [
            (0, Duration::from_secs(1), Duration::from_millis(1500)),
            (1, Duration::from_secs(2), Duration::from_secs(3)),
            (2, Duration::from_secs(4), Duration::from_secs(6)),
            (3, Duration::from_secs(8), Duration::from_secs(12)),
        ];
        for (retry, min, max) in cases {
            for _ in 0..100 {
                let d = backoff_delay(retry);
                assert!(
                    d >= min && d < max,
                    "backoff_delay({}) = {:?}, want [{:?}, {:?})",
                    retry,
                    d,
                    min,
                    max
                );
            }
        }
    }

    #[test]
    fn test_backoff_increases_on_average() {
        let n = 100u32;
        let avg = |retry: u32| -> Duration {
            (0..n).map(|_| backoff_delay(retry)).sum::<Duration>() / n
        };
        let (a0, a1, a2) = (avg(0), avg(1), avg(2));
        assert!(a1 > a0, "avg retry 1 ({:?}) should exceed retry 0 ({:?})", a1, a0);
        assert!(a2 > a1, "avg retry 2 ({:?}) should exceed retry 1 ({:?})", a2, a1);
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        // A runaway retry counter must not overflow the duration math.
        let d = backoff_delay(u32::MAX);
        assert!(d >= Duration::from_secs(65536));
        assert!(d < Duration::from_secs(98305));
    }
}
