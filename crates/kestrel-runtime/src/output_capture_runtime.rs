//! Bounded, incrementally decoded capture of a child's output stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const REPLACEMENT_CHAR: &str = "\u{FFFD}";

/// Keeps at most `limit` characters of a byte stream, decoding UTF-8 across
/// chunk boundaries. Data past the limit is dropped and flagged.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamCapture {
    text: String,
    chars: usize,
    limit: usize,
    truncated: bool,
    pending: Vec<u8>,
}

impl StreamCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        self.text.as_str()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.chars >= self.limit {
            self.truncated = true;
            self.pending.clear();
            return;
        }

        let mut buffer = std::mem::take(&mut self.pending);
        buffer.extend_from_slice(bytes);
        let mut cursor = 0;
        while cursor < buffer.len() {
            match std::str::from_utf8(&buffer[cursor..]) {
                Ok(valid) => {
                    self.push_str(valid);
                    cursor = buffer.len();
                }
                Err(error) => {
                    let valid_end = cursor + error.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&buffer[cursor..valid_end]) {
                        self.push_str(valid);
                    }
                    cursor = valid_end;
                    match error.error_len() {
                        Some(invalid_len) => {
                            self.push_str(REPLACEMENT_CHAR);
                            cursor += invalid_len;
                        }
                        None => {
                            // incomplete sequence at the end of this chunk
                            self.pending = buffer[cursor..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Flushes a dangling partial sequence as a replacement character.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.push_str(REPLACEMENT_CHAR);
        }
    }

    pub fn into_parts(mut self) -> (String, bool) {
        self.finish();
        (self.text, self.truncated)
    }

    fn push_str(&mut self, value: &str) {
        let remaining = self.limit.saturating_sub(self.chars);
        if remaining == 0 {
            if !value.is_empty() {
                self.truncated = true;
            }
            return;
        }
        match value.char_indices().nth(remaining) {
            Some((cut, _)) => {
                self.text.push_str(&value[..cut]);
                self.chars += remaining;
                self.truncated = true;
            }
            None => {
                self.text.push_str(value);
                self.chars += value.chars().count();
            }
        }
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reads `reader` to EOF into the shared capture. The pipe is drained even
/// after the capture is full so the writer never blocks.
pub(crate) fn spawn_capture_reader<R>(
    mut reader: R,
    capture: Arc<Mutex<StreamCapture>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => lock_unpoisoned(&capture).push_bytes(&chunk[..read]),
                Err(error) => {
                    tracing::debug!(error = %error, "output capture read failed");
                    break;
                }
            }
        }
    })
}

/// Gives the reader `drain_window` to hit EOF, then takes whatever was captured.
pub(crate) async fn collect_capture(
    reader: Option<JoinHandle<()>>,
    capture: &Arc<Mutex<StreamCapture>>,
    drain_window: Duration,
) -> (String, bool) {
    if let Some(mut reader) = reader {
        if tokio::time::timeout(drain_window, &mut reader).await.is_err() {
            // a grandchild still holds the pipe open
            reader.abort();
        }
    }
    let captured = std::mem::take(&mut *lock_unpoisoned(capture));
    captured.into_parts()
}

#[cfg(test)]
mod tests {
    use super::StreamCapture;

    #[test]
    fn unit_multibyte_sequence_split_across_chunks_decodes_once() {
        let bytes = "héllo".as_bytes();
        let mut capture = StreamCapture::new(100);
        capture.push_bytes(&bytes[..2]);
        capture.push_bytes(&bytes[2..]);
        assert_eq!(capture.into_parts(), ("héllo".to_string(), false));
    }

    #[test]
    fn unit_invalid_bytes_become_replacement_characters() {
        let mut capture = StreamCapture::new(100);
        capture.push_bytes(&[b'a', 0xff, b'b']);
        capture.push_bytes(&[0xe2, 0x82]);
        let (text, truncated) = capture.into_parts();
        assert_eq!(text, "a\u{FFFD}b\u{FFFD}");
        assert!(!truncated);
    }

    #[test]
    fn functional_limit_keeps_prefix_verbatim_and_flags_truncation() {
        let mut capture = StreamCapture::new(5);
        capture.push_bytes("ab🙂".as_bytes());
        capture.push_bytes("cdefgh".as_bytes());
        capture.push_bytes("ignored".as_bytes());
        assert_eq!(capture.text(), "ab🙂cd");
        assert!(capture.truncated());
    }

    #[test]
    fn regression_exact_fit_is_not_truncated() {
        let mut capture = StreamCapture::new(3);
        capture.push_bytes(b"abc");
        assert_eq!(capture.into_parts(), ("abc".to_string(), false));
    }
}
