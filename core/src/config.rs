//! Tunables for the session service, including the environment overrides
//! recognized at tool construction time.

pub const DEFAULT_YIELD_MS: u64 = 20_000;
pub const MIN_YIELD_MS: u64 = 10;
pub const MAX_YIELD_MS: u64 = 120_000;

pub const DEFAULT_TIMEOUT_SECS: i64 = 1_800;

pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 30_000;
pub const MIN_MAX_OUTPUT_CHARS: usize = 1_000;
pub const MAX_MAX_OUTPUT_CHARS: usize = 150_000;

/// Incoming output is appended in slices of at most this many characters;
/// one progress update is emitted per appended slice.
pub const OUTPUT_SLICE_CHARS: usize = 8 * 1024;

/// Bounded suffix of aggregated output kept for previews.
pub const TAIL_MAX_CHARS: usize = 4_096;

/// Retention window for finished sessions. Zero disables the sweeper.
pub const DEFAULT_JOB_TTL_MS: u64 = 30 * 60 * 1_000;

pub const YIELD_MS_ENV: &str = "PI_BASH_YIELD_MS";
pub const MAX_OUTPUT_CHARS_ENV: &str = "PI_BASH_MAX_OUTPUT_CHARS";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default synchronous wait before a run is backgrounded.
    pub yield_ms: u64,
    /// Per-session cap on aggregated captured output, in characters.
    pub max_output_chars: usize,
    /// Retention for finished sessions before the sweeper removes them.
    pub job_ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            yield_ms: DEFAULT_YIELD_MS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            job_ttl_ms: DEFAULT_JOB_TTL_MS,
        }
    }
}

impl SessionConfig {
    /// Build a config from the process environment
    /// (`PI_BASH_YIELD_MS`, `PI_BASH_MAX_OUTPUT_CHARS`).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = lookup(YIELD_MS_ENV).and_then(|v| v.trim().parse::<u64>().ok()) {
            config.yield_ms = clamp_yield_ms(ms);
        }
        if let Some(chars) = lookup(MAX_OUTPUT_CHARS_ENV).and_then(|v| v.trim().parse::<usize>().ok())
        {
            config.max_output_chars = chars.clamp(MIN_MAX_OUTPUT_CHARS, MAX_MAX_OUTPUT_CHARS);
        }
        config
    }
}

pub(crate) fn clamp_yield_ms(ms: u64) -> u64 {
    ms.clamp(MIN_YIELD_MS, MAX_YIELD_MS)
}
