pub mod kalshi;
pub mod normalize;
pub mod polymarket;

use std::time::Duration;

use rand::Rng;

/// Reconnect delay: `min(base · 2^attempt + jitter, cap)` with jitter uniform
/// in `[0, base)`. Attempt is reset by the caller after a successful open.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..base_ms)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter).min(cap_ms))
}

/// Sampling predicate for high-frequency warning paths: log the first ten
/// occurrences, then every thousandth.
pub fn sampled(count: u64) -> bool {
    count <= 10 || count % 1000 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = 1000;
        let cap = 30_000;
        // attempt 0: [1000, 2000), attempt 3: [8000, 9000)
        for _ in 0..20 {
            let d0 = backoff_delay(0, base, cap).as_millis() as u64;
            assert!((1000..2000).contains(&d0), "d0={d0}");
            let d3 = backoff_delay(3, base, cap).as_millis() as u64;
            assert!((8000..9000).contains(&d3), "d3={d3}");
            // far attempts always hit the cap
            assert_eq!(backoff_delay(12, base, cap).as_millis() as u64, cap);
        }
    }

    #[test]
    fn backoff_attempt_overflow_saturates() {
        let d = backoff_delay(u32::MAX, 1000, 30_000);
        assert_eq!(d.as_millis() as u64, 30_000);
    }

    #[test]
    fn sampling_keeps_head_and_every_thousandth() {
        assert!(sampled(1));
        assert!(sampled(10));
        assert!(!sampled(11));
        assert!(sampled(1000));
        assert!(!sampled(1001));
        assert!(sampled(2000));
    }
}
