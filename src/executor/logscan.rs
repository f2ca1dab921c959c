//! Single-pass scanning of the merged console stream.
//!
//! While shard output flows by, a small state machine tracks which test
//! is currently running and accumulates its console lines. When a
//! failure marker is seen for the current test, the accumulated excerpt
//! (start line through failure line) is stored so the aggregator can
//! attach it to that test's structured result.
//!
//! The scanner also classifies device-log lines (logcat) so the caller
//! can elide them from the visible stream when verbose output is off.

use std::collections::HashMap;

use regex::Regex;

/// Matches the start-of-test marker, capturing the test name, e.g.
/// `[ RUN      ] org.ui.ForeignSessionItemViewBinderUnitTest.test_phone[28]`.
fn test_start_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^.*\[\s+RUN\s+\]\s(.*)").expect("start pattern is valid"))
}

/// Matches a test failure marker, e.g.
/// `[ FAILED ] org.ui.ForeignBinderUnitTest.test_phone[28] (56 ms)`.
fn test_failure_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^.*\[\s+(?:FAILED|CRASHED|TIMEOUT)\s+\]").expect("failure pattern is valid")
    })
}

/// Matches a shard-prefixed device log line, e.g. ` 0| I/AssetManager: not found`.
fn device_log_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^ ?\d+\| (?::?\d+\| )?[A-Z]/[\w\d_-]+:").expect("device log pattern is valid")
    })
}

/// Scanner state: either between tests or inside a running test.
enum ScanState {
    Idle,
    InTest { name: String, lines: Vec<String> },
}

/// Scans console lines for failure-log excerpts.
///
/// Feed every merged output line to [`observe`](LogScanner::observe);
/// collect the captured excerpts with
/// [`into_failure_logs`](LogScanner::into_failure_logs) once the stream
/// has been fully consumed.
pub struct LogScanner {
    state: ScanState,
    failure_logs: HashMap<String, String>,
}

impl LogScanner {
    /// Create a scanner in the idle state.
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            failure_logs: HashMap::new(),
        }
    }

    /// Observe one line of merged output.
    ///
    /// Lines between a test's start marker and its failure marker are
    /// accumulated; output after a failure and before the next start is
    /// discarded.
    pub fn observe(&mut self, line: &str) {
        if let Some(caps) = test_start_pattern().captures(line) {
            self.state = ScanState::InTest {
                name: caps[1].replace('#', "."),
                lines: vec![line.to_string()],
            };
            return;
        }

        if let ScanState::InTest { name, lines } = &mut self.state {
            lines.push(line.to_string());
            if test_failure_pattern().is_match(line) {
                self.failure_logs.insert(name.clone(), lines.join("\n"));
                self.state = ScanState::Idle;
            }
        }
    }

    /// Captured excerpts keyed by normalized test name (`#` replaced by `.`).
    pub fn into_failure_logs(self) -> HashMap<String, String> {
        self.failure_logs
    }
}

impl Default for LogScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// True if `line` is a device log line that may be elided from the
/// visible console stream.
pub fn is_device_log(line: &str) -> bool {
    device_log_pattern().is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_excerpt_between_start_and_failure() {
        let mut scanner = LogScanner::new();
        scanner.observe(" 0| [ RUN      ] org.ui.FooTest.test_a[28]");
        scanner.observe(" 0| some assertion context");
        scanner.observe(" 0| [ FAILED ] org.ui.FooTest.test_a[28] (56 ms)");

        let logs = scanner.into_failure_logs();
        let excerpt = logs.get("org.ui.FooTest.test_a[28]").unwrap();
        assert!(excerpt.starts_with(" 0| [ RUN"));
        assert!(excerpt.contains("assertion context"));
        assert!(excerpt.ends_with("(56 ms)"));
    }

    #[test]
    fn test_passing_test_leaves_no_excerpt() {
        let mut scanner = LogScanner::new();
        scanner.observe(" 0| [ RUN      ] org.ui.FooTest.test_a[28]");
        scanner.observe(" 0| [       OK ] org.ui.FooTest.test_a[28] (3 ms)");
        scanner.observe(" 0| [ RUN      ] org.ui.FooTest.test_b[28]");
        scanner.observe(" 0| [ FAILED ] org.ui.FooTest.test_b[28] (1 ms)");

        let logs = scanner.into_failure_logs();
        assert!(!logs.contains_key("org.ui.FooTest.test_a[28]"));
        assert!(logs.contains_key("org.ui.FooTest.test_b[28]"));
    }

    #[test]
    fn test_crash_and_timeout_markers_count_as_failures() {
        for marker in ["CRASHED", "TIMEOUT"] {
            let mut scanner = LogScanner::new();
            scanner.observe(" 1| [ RUN      ] a.BTest.test_c[28]");
            scanner.observe(&format!(" 1| [ {marker} ] a.BTest.test_c[28]"));
            assert!(scanner.into_failure_logs().contains_key("a.BTest.test_c[28]"));
        }
    }

    #[test]
    fn test_failure_without_running_test_is_ignored() {
        let mut scanner = LogScanner::new();
        scanner.observe(" 0| [ FAILED ] a.BTest.test_c[28]");
        assert!(scanner.into_failure_logs().is_empty());
    }

    #[test]
    fn test_output_after_failure_is_discarded() {
        let mut scanner = LogScanner::new();
        scanner.observe(" 0| [ RUN      ] a.BTest.test_c[28]");
        scanner.observe(" 0| [ FAILED ] a.BTest.test_c[28]");
        scanner.observe(" 0| teardown noise");

        let logs = scanner.into_failure_logs();
        assert!(!logs["a.BTest.test_c[28]"].contains("teardown noise"));
    }

    #[test]
    fn test_start_marker_name_is_normalized() {
        let mut scanner = LogScanner::new();
        scanner.observe(" 0| [ RUN      ] a.BTest#test_c[28]");
        scanner.observe(" 0| [ FAILED ] a.BTest#test_c[28]");
        assert!(scanner.into_failure_logs().contains_key("a.BTest.test_c[28]"));
    }

    #[test]
    fn test_device_log_classification() {
        assert!(is_device_log(" 0| I/AssetManager: not found"));
        assert!(is_device_log(" 12| W/chromium_net-1: stalled"));
        assert!(is_device_log(" 3| 142| E/Art: oat file"));
        assert!(!is_device_log(" 0| [ RUN      ] a.BTest.test_c[28]"));
        assert!(!is_device_log("plain runner output"));
    }
}
