//! Bounded, append-only transcript storage shared across threads.

use std::sync::Mutex;

/// Banner inserted at the front of a buffer that has dropped old content.
pub const TRUNCATION_BANNER: &str = "\n…(truncated)\n";

/// A capped rolling log of run activity.
///
/// Appends are newline-terminated and serialized behind a mutex so reader
/// threads (for example shell output pumps) can write concurrently. When the
/// buffer outgrows its cap, the oldest bytes are dropped and a truncation
/// banner marks the cut.
#[derive(Debug)]
pub struct TranscriptBuffer {
    inner: Mutex<String>,
    max_bytes: usize,
}

impl TranscriptBuffer {
    pub fn new(max_bytes: usize) -> Self {
        TranscriptBuffer { inner: Mutex::new(String::new()), max_bytes }
    }

    /// Appends `text`, adding a trailing newline when missing. Empty input is
    /// ignored.
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_str(text);
        if !text.ends_with('\n') {
            buf.push('\n');
        }
        if self.max_bytes > 0 && buf.len() > self.max_bytes {
            let keep = self.max_bytes.saturating_sub(TRUNCATION_BANNER.len());
            let mut cut = buf.len() - keep;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            let mut kept = buf.split_off(cut);
            if !kept.starts_with(TRUNCATION_BANNER) {
                kept.insert_str(0, TRUNCATION_BANNER);
            }
            *buf = kept;
        }
    }

    pub fn contents(&self) -> String {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
