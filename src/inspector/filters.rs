//! Pure filter-matching helpers for `GET /api/requests/http` (§4.9, §8
//! invariant 11), split out from the handler so they can be unit tested
//! directly against the literal scenarios in §8's end-to-end list rather
//! than only through an HTTP round-trip.

use std::time::Duration;

/// `NNNxx` bucket filters match `code ∈ [N00, N00+100)`; a bare integer
/// filter matches exactly. Case-insensitive on the `xx` suffix.
pub fn matches_status(code: u16, filter: &str) -> bool {
    let filter = filter.trim();
    if let Some(bucket) = filter.strip_suffix("xx").or_else(|| filter.strip_suffix("XX")) {
        match bucket.parse::<u16>() {
            Ok(n) if (1..=5).contains(&n) => {
                let base = n * 100;
                (base..base + 100).contains(&code)
            }
            _ => false,
        }
    } else {
        filter.parse::<u16>().map(|n| n == code).unwrap_or(false)
    }
}

/// Case-insensitive exact method match.
pub fn matches_method(method: &str, filter: &str) -> bool {
    method.eq_ignore_ascii_case(filter)
}

pub fn matches_path(path: &str, glob_pattern: &str) -> bool {
    glob::Pattern::new(glob_pattern)
        .map(|pattern| pattern.matches(path))
        .unwrap_or(false)
}

pub fn matches_search(search: &str, request_body: &[u8], response_body: &[u8]) -> bool {
    let request = String::from_utf8_lossy(request_body);
    let response = String::from_utf8_lossy(response_body);
    request.contains(search) || response.contains(search)
}

/// Parse a relative duration like `"5m"` (via `humantime`) and return the
/// millisecond cutoff: exchanges started before `now - duration` are
/// excluded by the `since` filter.
pub fn since_cutoff_millis(now_millis: i64, since: &str) -> Option<i64> {
    let duration: Duration = humantime::parse_duration(since).ok()?;
    Some(now_millis - duration.as_millis() as i64)
}
