/// Utility helpers shared by connectors and transformers.
///
/// IMPORTANT:
/// - No connector-specific behavior should live here.
/// - Helpers must stay small and deterministic.
///
use std::collections::HashMap;
use std::time::Duration;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Reads an integer nanosecond duration from a connector option map.
///
/// "60000000000" is one minute.
///
/// RETURNS:
/// - `Ok(None)` if the key is absent
/// - `Ok(Some(duration))` for a non-negative integer
/// - `Err(raw)` with the raw value if it is not an integer
///
pub fn option_nanos(
    args: &HashMap<String, String>,
    key: &str,
) -> Result<Option<Duration>, String> {
    match args.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ns| Some(Duration::from_nanos(ns)))
            .map_err(|_| raw.clone()),
    }
}
