use std::env;
use std::sync::OnceLock;

static XPURS_PASS_MAX_ITERS: OnceLock<usize> = OnceLock::new();
static XPURS_PASS_STATS: OnceLock<bool> = OnceLock::new();
static XPURS_VERIFY_PASSES: OnceLock<bool> = OnceLock::new();

const DEFAULT_PASS_MAX_ITERS: usize = 8;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_bool(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

fn parse_iters(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

/// Upper bound on iterations of every fixed-point group in the pass pipeline.
pub(crate) fn pass_max_iters() -> usize {
    *XPURS_PASS_MAX_ITERS.get_or_init(|| {
        env::var("XPURS_PASS_MAX_ITERS")
            .ok()
            .and_then(|v| parse_iters(&v))
            .unwrap_or(DEFAULT_PASS_MAX_ITERS)
    })
}

pub(crate) fn pass_stats_enabled() -> bool {
    *XPURS_PASS_STATS.get_or_init(|| read_bool("XPURS_PASS_STATS"))
}

/// Re-verify the module after every pass.
pub(crate) fn verify_passes_enabled() -> bool {
    *XPURS_VERIFY_PASSES.get_or_init(|| read_bool("XPURS_VERIFY_PASSES"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_values() {
        assert!(parse_bool(" On "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("maybe"));
    }

    #[test]
    fn iteration_values() {
        assert_eq!(parse_iters("12"), Some(12));
        assert_eq!(parse_iters("0"), None);
        assert_eq!(parse_iters("x"), None);
    }
}
