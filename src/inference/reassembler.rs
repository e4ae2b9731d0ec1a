//! Incremental UTF-8 reassembly
//!
//! Models emit text one token at a time and a token's piece may stop in the
//! middle of a multi-byte character. [`Utf8Reassembler`] buffers those bytes
//! and only releases whole characters.

/// Placeholder for malformed or unterminated byte sequences
pub const PLACEHOLDER: char = char::REPLACEMENT_CHARACTER;

/// Expected length of a sequence given its leading byte.
///
/// `None` for continuation bytes and bytes that can never start a valid
/// sequence (overlong `C0`/`C1`, out of range `F5..=FF`).
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Carry-over buffer between token pieces
#[derive(Debug, Default)]
pub struct Utf8Reassembler {
    pending: Vec<u8>,
}

impl Utf8Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns every complete character now available.
    pub fn push(&mut self, fragment: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(fragment);
        let text = self.drain_complete();
        (!text.is_empty()).then_some(text)
    }

    /// Emits what is left at the end of a generation. An unterminated tail
    /// becomes a single placeholder so nothing carries into the next session.
    pub fn flush(&mut self) -> Option<String> {
        let mut text = self.drain_complete();
        if !self.pending.is_empty() {
            tracing::debug!("Replacing {} dangling byte(s)", self.pending.len());
            self.pending.clear();
            text.push(PLACEHOLDER);
        }
        (!text.is_empty()).then_some(text)
    }

    /// Drops buffered bytes without emitting them
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Consumes the longest prefix made of complete characters. Invalid
    /// units are consumed one byte at a time and replaced.
    fn drain_complete(&mut self) -> String {
        let buf = &self.pending;
        let mut out = String::with_capacity(buf.len());
        let mut i = 0;

        while i < buf.len() {
            let Some(len) = sequence_len(buf[i]) else {
                out.push(PLACEHOLDER);
                i += 1;
                continue;
            };

            let end = i + len;
            if end > buf.len() {
                if buf[i + 1..].iter().all(|&b| is_continuation(b)) {
                    // Incomplete but still plausible: wait for more bytes
                    break;
                }
                out.push(PLACEHOLDER);
                i += 1;
                continue;
            }

            match std::str::from_utf8(&buf[i..end]) {
                Ok(s) => {
                    out.push_str(s);
                    i = end;
                }
                Err(_) => {
                    out.push(PLACEHOLDER);
                    i += 1;
                }
            }
        }

        self.pending.drain(..i);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(fragments: &[&[u8]]) -> String {
        let mut reassembler = Utf8Reassembler::new();
        let mut out = String::new();
        for fragment in fragments {
            if let Some(text) = reassembler.push(fragment) {
                out.push_str(&text);
            }
        }
        if let Some(text) = reassembler.flush() {
            out.push_str(&text);
        }
        out
    }

    #[test]
    fn test_ascii_passes_through() {
        let mut reassembler = Utf8Reassembler::new();
        assert_eq!(reassembler.push(b"Hello").as_deref(), Some("Hello"));
        assert_eq!(reassembler.pending_len(), 0);
    }

    #[test]
    fn test_split_multibyte_is_held_back() {
        let bytes = "你好".as_bytes();
        let mut reassembler = Utf8Reassembler::new();

        assert_eq!(reassembler.push(&bytes[..1]), None);
        assert_eq!(reassembler.push(&bytes[1..4]).as_deref(), Some("你"));
        assert_eq!(reassembler.pending_len(), 1);
        assert_eq!(reassembler.push(&bytes[4..]).as_deref(), Some("好"));
        assert_eq!(reassembler.flush(), None);
    }

    #[test]
    fn test_every_split_of_valid_text_round_trips() {
        let text = "aé€😀 ok 中文";
        let bytes = text.as_bytes();

        for cut in 0..=bytes.len() {
            for cut2 in cut..=bytes.len() {
                let mut reassembler = Utf8Reassembler::new();
                let mut out = String::new();
                for fragment in [&bytes[..cut], &bytes[cut..cut2], &bytes[cut2..]] {
                    if let Some(piece) = reassembler.push(fragment) {
                        // Each emitted piece must itself be a prefix-aligned
                        // chunk of the original text
                        assert!(text[out.len()..].starts_with(&piece));
                        out.push_str(&piece);
                    }
                }
                assert_eq!(reassembler.flush(), None);
                assert_eq!(out, text);
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let text = "ümlaut 🎉";
        let fragments: Vec<&[u8]> = text.as_bytes().chunks(1).collect();
        assert_eq!(collect(&fragments), text);
    }

    #[test]
    fn test_invalid_lead_byte_replaced() {
        let mut reassembler = Utf8Reassembler::new();
        let out = reassembler.push(&[b'a', 0xFF, b'b']);
        assert_eq!(out.as_deref(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn test_stray_continuation_replaced() {
        assert_eq!(collect(&[&[0x80, b'x']]), "\u{FFFD}x");
    }

    #[test]
    fn test_broken_sequence_does_not_swallow_next_char() {
        // E4 expects two continuation bytes but 'z' interrupts it
        assert_eq!(collect(&[&[0xE4, b'z']]), "\u{FFFD}z");
    }

    #[test]
    fn test_flush_replaces_dangling_tail() {
        let mut reassembler = Utf8Reassembler::new();
        assert_eq!(reassembler.push(&[b'o', b'k', 0xF0, 0x9F]).as_deref(), Some("ok"));
        assert_eq!(reassembler.flush().as_deref(), Some("\u{FFFD}"));
        assert_eq!(reassembler.pending_len(), 0);
    }

    #[test]
    fn test_overlong_sequence_replaced() {
        // C0 is never a valid lead; E0 80 80 is an overlong encoding
        assert_eq!(collect(&[&[0xC0, 0xAF]]), "\u{FFFD}\u{FFFD}");
        assert_eq!(collect(&[&[0xE0, 0x80, 0x80]]), "\u{FFFD}\u{FFFD}\u{FFFD}");
    }

    #[test]
    fn test_reset_discards() {
        let mut reassembler = Utf8Reassembler::new();
        reassembler.push(&[0xE4, 0xBD]);
        reassembler.reset();
        assert_eq!(reassembler.flush(), None);
    }
}
