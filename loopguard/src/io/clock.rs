//! Timestamps and identifiers.

use chrono::{SecondsFormat, Utc};
use rand::{Rng, distributions::Alphanumeric};

/// RFC 3339 UTC timestamp with millisecond precision.
///
/// Lexicographic order matches chronological order, which the store relies on.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Identifier of the form `<prefix>-<yyyymmdd_hhmmss>-<suffix>`.
pub fn new_id(prefix: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    format!("{prefix}-{stamp}-{}", random_suffix(6))
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .take(len)
        .collect()
}
