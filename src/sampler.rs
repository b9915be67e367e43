//! Deterministic trace-level sampling.
//!
//! Admission is decided once per trace identifier so all events belonging to
//! one trace are kept or dropped together. The hash is a documented,
//! platform-independent algorithm (rolling multiplicative hash followed by
//! two avalanche rounds) rather than a language-default hasher, so clients
//! in other languages can agree on the decision for the same key.

use tracing::warn;

/// Hash `key` into `[0, 1)` deterministically.
fn hash_unit(key: &str) -> f64 {
    // Rolling hash with prime 31 over UTF-8 bytes.
    let mut h: u32 = 0;
    for byte in key.as_bytes() {
        h = h.wrapping_mul(31).wrapping_add(u32::from(*byte));
    }

    // Two xorshift/multiply mixing rounds (murmur3 fmix32 constants) so
    // nearby keys land far apart.
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;

    f64::from(h) / (u32::MAX as f64 + 1.0)
}

/// Decide whether events keyed by `key` (typically a trace id) are admitted
/// at the given sample `rate`.
///
/// `None` disables sampling (always admit). `0.0` always drops. A rate
/// outside `[0, 1]` or NaN logs a warning and fails open, never silently
/// dropping more than requested.
pub fn is_in_sample(key: &str, rate: Option<f64>) -> bool {
    let Some(rate) = rate else {
        return true;
    };
    if rate.is_nan() || !(0.0..=1.0).contains(&rate) {
        warn!(rate, "Invalid sample rate, sampling disabled for this decision");
        return true;
    }
    if rate == 0.0 {
        return false;
    }
    hash_unit(key) < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rate_always_admits() {
        assert!(is_in_sample("any-trace", None));
    }

    #[test]
    fn test_rate_one_always_admits() {
        for key in ["a", "b", "trace-123", ""] {
            assert!(is_in_sample(key, Some(1.0)));
        }
    }

    #[test]
    fn test_rate_zero_always_drops() {
        for key in ["a", "b", "trace-123", ""] {
            assert!(!is_in_sample(key, Some(0.0)));
        }
    }

    #[test]
    fn test_invalid_rate_fails_open() {
        assert!(is_in_sample("trace", Some(-0.5)));
        assert!(is_in_sample("trace", Some(1.5)));
        assert!(is_in_sample("trace", Some(f64::NAN)));
    }

    #[test]
    fn test_decision_is_deterministic() {
        for key in ["trace-a", "trace-b", "trace-c", "trace-d"] {
            let first = is_in_sample(key, Some(0.5));
            for _ in 0..100 {
                assert_eq!(is_in_sample(key, Some(0.5)), first);
            }
        }
    }

    #[test]
    fn test_hash_is_unit_interval() {
        for key in ["", "x", "trace-12345", "🦀", "a-very-long-trace-identifier"] {
            let h = hash_unit(key);
            assert!((0.0..1.0).contains(&h), "hash({key:?}) = {h}");
        }
    }

    #[test]
    fn test_rate_roughly_controls_admission() {
        // Not a statistical test, just a sanity check that a 0.5 rate
        // admits some keys and drops others.
        let keys: Vec<String> = (0..200).map(|i| format!("trace-{i}")).collect();
        let admitted = keys
            .iter()
            .filter(|k| is_in_sample(k, Some(0.5)))
            .count();
        assert!(admitted > 40 && admitted < 160, "admitted = {admitted}");
    }
}
