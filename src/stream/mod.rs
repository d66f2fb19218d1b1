//! Stream handler - incremental text sink for process output
//!
//! Every write is normalized and appended to the full text. A bounded
//! "live" projection is kept next to it for constant UI refresh: it stops
//! growing once either cap is hit and its callback fires at most once per
//! throttle interval, except for the final write which always flushes.

pub mod normalize;

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub use normalize::{Normalization, Normalizer};

/// Minimum time between two live callbacks
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(30);

/// Appended to the live text when a cap is hit
pub const ELLIPSIS: char = '…';

/// Caps of the live projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveLimits {
    pub max_chars: usize,
    pub max_lines: usize,
}

impl Default for LiveLimits {
    fn default() -> Self {
        Self {
            max_chars: 10_000,
            max_lines: 100,
        }
    }
}

pub type LiveCallback = Box<dyn FnMut(&str) + Send>;

pub struct StreamHandler {
    normalizer: Normalizer,
    limits: LiveLimits,
    full: String,
    live: String,
    live_chars: usize,
    live_lines: usize,
    at_line_start: bool,
    pending: String,
    capped: bool,
    last_flush: Option<Instant>,
    callback: Option<LiveCallback>,
}

impl fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandler")
            .field("policy", &self.normalizer.policy())
            .field("limits", &self.limits)
            .field("full_len", &self.full.len())
            .field("live_chars", &self.live_chars)
            .field("capped", &self.capped)
            .finish()
    }
}

impl StreamHandler {
    pub fn new(policy: Normalization, limits: LiveLimits) -> Self {
        Self {
            normalizer: Normalizer::new(policy),
            limits,
            full: String::new(),
            live: String::new(),
            live_chars: 0,
            live_lines: 0,
            at_line_start: true,
            pending: String::new(),
            capped: false,
            last_flush: None,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn set_callback(&mut self, callback: impl FnMut(&str) + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Ingest a chunk. `is_final` marks end of stream; an empty final write
    /// is the canonical "channel closed" signal and always reaches the callback.
    pub fn write(&mut self, chunk: &str, is_final: bool) {
        let mut text = self.normalizer.push(chunk);
        if is_final {
            text.push_str(&self.normalizer.finish());
        }
        self.full.push_str(&text);

        if self.capped {
            if is_final {
                self.flush();
            }
            return;
        }

        for c in text.chars() {
            if self.would_overflow() {
                self.live.push(ELLIPSIS);
                self.pending.push(ELLIPSIS);
                self.capped = true;
                break;
            }
            if self.at_line_start {
                self.live_lines += 1;
            }
            self.at_line_start = c == '\n';
            self.live.push(c);
            self.pending.push(c);
            self.live_chars += 1;
        }

        let due = match self.last_flush {
            Some(last) => last.elapsed() >= THROTTLE_INTERVAL,
            None => true,
        };
        if is_final || (due && !self.pending.is_empty()) {
            self.flush();
        }
    }

    /// Clear all text and carried state; callback and limits are kept
    pub fn reset(&mut self) {
        self.normalizer.reset();
        self.full.clear();
        self.live.clear();
        self.live_chars = 0;
        self.live_lines = 0;
        self.at_line_start = true;
        self.pending.clear();
        self.capped = false;
        self.last_flush = None;
    }

    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn live(&self) -> &str {
        &self.live
    }

    pub fn is_capped(&self) -> bool {
        self.capped
    }

    pub fn policy(&self) -> Normalization {
        self.normalizer.policy()
    }

    /// A character overflows if the char cap is full, or if it would open a
    /// line past the line cap (blank lines count)
    fn would_overflow(&self) -> bool {
        self.live_chars >= self.limits.max_chars
            || (self.at_line_start && self.live_lines >= self.limits.max_lines)
    }

    fn flush(&mut self) {
        self.last_flush = Some(Instant::now());
        let chunk = std::mem::take(&mut self.pending);
        if let Some(callback) = self.callback.as_mut() {
            callback(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, move |chunk: &str| sink.lock().unwrap().push(chunk.to_string()))
    }

    fn limits(max_chars: usize, max_lines: usize) -> LiveLimits {
        LiveLimits {
            max_chars,
            max_lines,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapse_mode_full_text() {
        let mut handler = StreamHandler::new(Normalization::Collapse, LiveLimits::default());
        handler.write("a  b", false);
        assert_eq!(handler.full(), "a b");
        assert_eq!(handler.live(), "a b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserve_mode_full_text() {
        let mut handler = StreamHandler::new(Normalization::Preserve, LiveLimits::default());
        handler.write("a  b", false);
        assert_eq!(handler.full(), "a  b");
        handler.write("  \nc", true);
        assert_eq!(handler.full(), "a  b\nc\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_within_interval_are_batched() {
        let (calls, callback) = recorder();
        let mut handler =
            StreamHandler::new(Normalization::Collapse, LiveLimits::default()).with_callback(callback);

        handler.write("1\n", false);
        handler.write("2\n", false);
        handler.write("3\n", false);
        assert_eq!(*calls.lock().unwrap(), vec!["1\n"]);

        tokio::time::advance(THROTTLE_INTERVAL).await;
        handler.write("4\n", false);
        assert_eq!(*calls.lock().unwrap(), vec!["1\n", "2\n3\n4\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_write_bypasses_throttle() {
        let (calls, callback) = recorder();
        let mut handler =
            StreamHandler::new(Normalization::Collapse, LiveLimits::default()).with_callback(callback);

        handler.write("1\n", false);
        handler.write("2\n", false);
        handler.write("", true);
        assert_eq!(*calls.lock().unwrap(), vec!["1\n", "2\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_final_write_still_notifies() {
        let (calls, callback) = recorder();
        let mut handler =
            StreamHandler::new(Normalization::Collapse, LiveLimits::default()).with_callback(callback);

        handler.write("x", false);
        handler.write("", true);
        assert_eq!(*calls.lock().unwrap(), vec!["x", ""]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_char_cap_freezes_live_text() {
        let (calls, callback) = recorder();
        let mut handler =
            StreamHandler::new(Normalization::Collapse, limits(5, 100)).with_callback(callback);

        handler.write("abcdefgh", false);
        assert!(handler.is_capped());
        assert_eq!(handler.live(), "abcde…");

        handler.write("ijk", false);
        assert_eq!(handler.full(), "abcdefghijk");
        assert_eq!(handler.live(), "abcde…");

        handler.write("", true);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.join(""), "abcde…");
        assert_eq!(calls.iter().filter(|c| c.contains(ELLIPSIS)).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_cap() {
        let mut handler = StreamHandler::new(Normalization::Collapse, limits(1000, 2));
        handler.write("1\n2\n", false);
        assert!(!handler.is_capped());
        handler.write("3\n4\n", false);
        assert!(handler.is_capped());
        assert_eq!(handler.live(), "1\n2\n…");
        assert_eq!(handler.full(), "1\n2\n3\n4\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_then_final_flushes_pending() {
        let (calls, callback) = recorder();
        let mut handler =
            StreamHandler::new(Normalization::Collapse, limits(3, 100)).with_callback(callback);

        handler.write("ab", false);
        handler.write("cdef", false);
        assert_eq!(*calls.lock().unwrap(), vec!["ab"]);
        handler.write("more", true);
        assert_eq!(*calls.lock().unwrap(), vec!["ab", "c…"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state() {
        let mut handler = StreamHandler::new(Normalization::Collapse, limits(2, 100));
        handler.write("abc ", false);
        assert!(handler.is_capped());

        handler.reset();
        assert_eq!(handler.full(), "");
        assert_eq!(handler.live(), "");
        assert!(!handler.is_capped());

        handler.write(" x", false);
        assert_eq!(handler.full(), " x");
    }

    proptest! {
        #[test]
        fn prop_collapse_never_double_space(chunks in prop::collection::vec("[ a\\r\\n]{0,12}", 0..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap();
            rt.block_on(async {
                let mut handler = StreamHandler::new(Normalization::Collapse, limits(20, 4));
                for chunk in &chunks {
                    handler.write(chunk, false);
                    prop_assert!(!handler.full().contains("  "));
                }
                Ok(())
            })?;
        }

        #[test]
        fn prop_live_is_bounded_prefix(
            chunks in prop::collection::vec("[ ab\\n]{0,16}", 0..16),
            max_chars in 1usize..40,
            max_lines in 1usize..6,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap();
            rt.block_on(async {
                let mut handler = StreamHandler::new(Normalization::Collapse, limits(max_chars, max_lines));
                let mut frozen: Option<String> = None;
                for chunk in &chunks {
                    handler.write(chunk, false);
                    let live = handler.live();
                    prop_assert!(handler.full().chars().count() >= live.chars().count());

                    let payload = live.trim_end_matches(ELLIPSIS);
                    prop_assert!(payload.chars().count() <= max_chars);
                    prop_assert!(payload.lines().count() <= max_lines);
                    prop_assert!(handler.full().starts_with(payload));

                    if let Some(previous) = &frozen {
                        prop_assert_eq!(previous.as_str(), live);
                    } else if handler.is_capped() {
                        frozen = Some(live.to_string());
                    }
                }
                Ok(())
            })?;
        }
    }
}
