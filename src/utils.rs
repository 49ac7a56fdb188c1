use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Normalize a display string from the playback service.
///
/// Strings whose letters are all uppercase are kept as they are (the artist
/// chose that styling); everything else is lowercased. Letters without case
/// and non-letters never force lowercasing. Applying it twice gives the same
/// result as applying it once.
pub fn normalize_display(s: &str) -> String {
    if is_all_caps(s) {
        s.to_string()
    } else {
        s.to_lowercase()
    }
}

fn is_all_caps(s: &str) -> bool {
    s.chars()
        .filter(|c| c.is_alphabetic())
        .all(|c| c.is_uppercase() || is_caseless(c))
}

fn is_caseless(c: char) -> bool {
    if c.is_lowercase() {
        return false;
    }
    let mut lower = c.to_lowercase();
    lower.next() == Some(c) && lower.next().is_none()
}

/// Format milliseconds as `m:ss`, or `h:mm:ss` past the hour.
pub fn format_clock(ms: u64) -> String {
    let total_secs = ms / 1000;
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs / 60) % 60, total_secs % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Seconds since the Unix epoch, saturating at zero for earlier instants.
pub fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
