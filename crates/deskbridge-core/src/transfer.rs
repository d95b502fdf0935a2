//! Outgoing transfer progress: rate and remaining-time text.

use chrono::{DateTime, TimeDelta, Utc};

const UNKNOWN_ERROR: &str = "An unknown error occurred";

fn plural(n: i64, one: &str, many: &str) -> String {
    format!("{} {}", n, if n == 1 { one } else { many })
}

/// Remaining time in words, rounded the way a progress dialog would show it.
pub fn format_time(seconds: i64) -> String {
    let seconds = seconds.max(0);

    if seconds < 60 {
        return plural(seconds, "second", "seconds");
    }

    if seconds < 60 * 60 {
        let minutes = (seconds + 30) / 60;
        return plural(minutes, "minute", "minutes");
    }

    let hours = seconds / (60 * 60);

    if seconds < 60 * 60 * 4 {
        let minutes = (seconds - hours * 60 * 60 + 30) / 60;
        return format!(
            "{}, {}",
            plural(hours, "hour", "hours"),
            plural(minutes, "minute", "minutes")
        );
    }

    format!("approximately {}", plural(hours, "hour", "hours"))
}

/// Transfer rate in bytes per second, as kB/s from 3000 B/s upwards.
pub fn rate_text(bytes_per_second: u64) -> String {
    if bytes_per_second >= 3000 {
        format!("{} kB/s", bytes_per_second / 1000)
    } else {
        format!("{} B/s", bytes_per_second)
    }
}

/// Label naming the file currently being sent.
pub fn sending_label(file_name: &str) -> String {
    format!("Sending {}", file_name)
}

/// Text for a failed call. A remote error with an empty message gets a
/// generic text.
pub fn error_text(message: Option<&str>) -> String {
    match message {
        Some(m) if !m.trim().is_empty() => m.to_string(),
        _ => UNKNOWN_ERROR.to_string(),
    }
}

/// Tracks a multi-file send and produces progress text at most once per
/// second.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_size: u64,
    file_count: usize,
    file_index: usize,
    total_sent: u64,
    current_size: u64,
    started: DateTime<Utc>,
    last_update: Option<DateTime<Utc>>,
}

impl ProgressTracker {
    pub fn new(total_size: u64, file_count: usize, started: DateTime<Utc>) -> Self {
        Self {
            total_size,
            file_count,
            file_index: 0,
            total_sent: 0,
            current_size: 0,
            started,
            last_update: None,
        }
    }

    /// Start the next file, of `size` bytes.
    pub fn begin_file(&mut self, size: u64) {
        self.current_size = size;
    }

    /// Mark the current file as done.
    pub fn complete_file(&mut self) {
        self.total_sent += self.current_size;
        self.current_size = 0;
        self.file_index += 1;
    }

    /// Zero-based index of the file being sent.
    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn is_done(&self) -> bool {
        self.file_index >= self.file_count
    }

    /// Overall fraction sent, given `transferred` bytes of the current file.
    pub fn fraction(&self, transferred: u64) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.total_sent + transferred) as f64 / self.total_size as f64
    }

    /// "Sending file I of N (RATE, TIME)", or `None` when less than a second
    /// has passed since the last text or nothing can be estimated yet.
    pub fn update(&mut self, transferred: u64, now: DateTime<Utc>) -> Option<String> {
        if let Some(last) = self.last_update
            && now < last + TimeDelta::seconds(1)
        {
            return None;
        }
        self.last_update = Some(now);

        let elapsed = (now - self.started).num_seconds();
        if elapsed <= 0 {
            return None;
        }

        let current_sent = self.total_sent + transferred;
        let rate = current_sent / elapsed as u64;
        if rate == 0 {
            return None;
        }

        let remaining = self.total_size.saturating_sub(current_sent) / rate;
        Some(format!(
            "Sending file {} of {} ({}, {})",
            self.file_index + 1,
            self.file_count,
            rate_text(rate),
            format_time(remaining as i64)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(-5), "0 seconds");
        assert_eq!(format_time(1), "1 second");
        assert_eq!(format_time(59), "59 seconds");
        assert_eq!(format_time(60), "1 minute");
        assert_eq!(format_time(89), "1 minute");
        assert_eq!(format_time(90), "2 minutes");
        assert_eq!(format_time(3599), "60 minutes");
        assert_eq!(format_time(3600), "1 hour, 0 minutes");
        assert_eq!(format_time(3600 + 61), "1 hour, 1 minute");
        assert_eq!(format_time(2 * 3600 + 45 * 60), "2 hours, 45 minutes");
        assert_eq!(format_time(4 * 3600), "approximately 4 hours");
        assert_eq!(format_time(30 * 3600), "approximately 30 hours");
    }

    #[test]
    fn test_rate_text() {
        assert_eq!(rate_text(0), "0 B/s");
        assert_eq!(rate_text(2999), "2999 B/s");
        assert_eq!(rate_text(3000), "3 kB/s");
        assert_eq!(rate_text(125_500), "125 kB/s");
    }

    #[test]
    fn test_error_text() {
        assert_eq!(error_text(Some("Connection refused")), "Connection refused");
        assert_eq!(error_text(Some("")), "An unknown error occurred");
        assert_eq!(error_text(None), "An unknown error occurred");
    }

    #[test]
    fn test_progress_throttled_to_one_second() {
        let mut tracker = ProgressTracker::new(100_000, 2, t0());
        tracker.begin_file(50_000);

        // no time has passed yet
        assert_eq!(tracker.update(1000, t0()), None);

        let text = tracker.update(20_000, t0() + TimeDelta::seconds(2)).unwrap();
        assert_eq!(text, "Sending file 1 of 2 (10 kB/s, 8 seconds)");

        assert_eq!(
            tracker.update(25_000, t0() + TimeDelta::milliseconds(2500)),
            None
        );
        assert!(tracker.update(30_000, t0() + TimeDelta::seconds(3)).is_some());
    }

    #[test]
    fn test_progress_across_files() {
        let mut tracker = ProgressTracker::new(4000, 2, t0());
        tracker.begin_file(2000);
        assert!((tracker.fraction(1000) - 0.25).abs() < f64::EPSILON);
        tracker.complete_file();
        tracker.begin_file(2000);
        assert_eq!(tracker.file_index(), 1);
        assert!((tracker.fraction(1000) - 0.75).abs() < f64::EPSILON);

        let text = tracker.update(1000, t0() + TimeDelta::seconds(10)).unwrap();
        assert_eq!(text, "Sending file 2 of 2 (300 B/s, 3 seconds)");

        tracker.complete_file();
        assert!(tracker.is_done());
    }

    #[test]
    fn test_fraction_with_empty_total() {
        let tracker = ProgressTracker::new(0, 1, t0());
        assert_eq!(tracker.fraction(10), 0.0);
    }
}
