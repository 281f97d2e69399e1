//! Central configuration constants for runtime limits and defaults.

use std::time::Duration;

/// Default delay before consulting the next mirror while the primary
/// (or an earlier mirror) is still pending.
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(5);

/// File name of the per-install version ledger, relative to the install root.
pub const LEDGER_FILE_NAME: &str = ".gantry-ledger.json";

/// Default number of download retry attempts per URL.
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 3;

/// Default speed limit when enabled (bytes per second). 5 MB/s.
pub const DEFAULT_SPEED_LIMIT_BYTES: u64 = 5 * 1024 * 1024;

/// Default external command template used to apply binary deltas.
/// Placeholders: {original} {delta} {output}.
pub const DEFAULT_PATCH_COMMAND: &str = "xdelta3 -d -f -s {original} {delta} {output}";

/// Clamp a stagger delay supplied by the host into a sane range.
pub fn clamp_stagger(v: Duration) -> Duration {
    v.clamp(Duration::from_millis(100), Duration::from_secs(60))
}
