//! Logical text buffer behind a terminal view.
//!
//! Received bytes are kept verbatim; the displayed text is recomputed from the
//! whole buffer on every render so a backspace can erase text that arrived in
//! an earlier chunk.

const BACKSPACE: char = '\u{08}';
const DELETE: char = '\u{7f}';

/// Resolve backspace and delete against the text preceding them.
///
/// The output never contains either control character, so applying this to
/// its own output changes nothing.
pub fn normalize(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == BACKSPACE || c == DELETE {
            output.pop();
        } else {
            output.push(c);
        }
    }
    output
}

#[derive(Debug, Clone)]
pub struct TerminalBuffer {
    raw: String,
    // Trailing bytes of a UTF-8 sequence split across reads
    partial: Vec<u8>,
    cursor_visible: bool,
    cursor_glyph: char,
}

impl TerminalBuffer {
    pub fn new(cursor_glyph: char) -> Self {
        Self {
            raw: String::new(),
            partial: Vec::new(),
            cursor_visible: true,
            cursor_glyph,
        }
    }

    /// Decode `bytes` and append them. Invalid UTF-8 becomes U+FFFD.
    pub fn append(&mut self, bytes: &[u8]) {
        let mut pending = std::mem::take(&mut self.partial);
        pending.extend_from_slice(bytes);

        let mut rest = pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.raw.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.raw.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.raw.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            self.partial = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Append a locally generated line (diagnostics), bypassing decoding.
    pub fn append_text(&mut self, text: &str) {
        self.flush_partial();
        self.raw.push_str(text);
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.partial.is_empty()
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        self.cursor_visible = visible;
    }

    /// Flip cursor visibility, returning the new state
    pub fn toggle_cursor(&mut self) -> bool {
        self.cursor_visible = !self.cursor_visible;
        self.cursor_visible
    }

    /// Normalized text, with the cursor glyph appended when `cursor_visible`.
    pub fn render(&self, cursor_visible: bool) -> String {
        let mut text = normalize(&self.raw);
        if cursor_visible {
            text.push(self.cursor_glyph);
        }
        text
    }

    /// Render using the buffer's own cursor state
    pub fn snapshot(&self) -> String {
        self.render(self.cursor_visible)
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.partial.clear();
    }

    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let partial = std::mem::take(&mut self.partial);
            self.raw.push_str(&String::from_utf8_lossy(&partial));
        }
    }
}

impl Default for TerminalBuffer {
    fn default() -> Self {
        Self::new('█')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_backspace_and_delete() {
        assert_eq!(normalize("abc\x08d"), "abd");
        assert_eq!(normalize("abc\x7f\x7fz"), "az");
        assert_eq!(normalize("\x08\x7fx"), "x");
        assert_eq!(normalize("ab\x08\x08\x08"), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "",
            "plain text\r\n",
            "a\x08b\x7fc",
            "\x7f\x7f\x7f",
            "héllo\x08 wörld\x7f",
            "line1\nline2\x08\x08\x08\x08\x08\x08\x08",
        ];
        for raw in samples {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "input {:?}", raw);
        }
    }

    #[test]
    fn test_backspace_spans_appends() {
        let mut buffer = TerminalBuffer::default();
        buffer.append(b"ab");
        buffer.append(b"\x7f c");
        assert_eq!(buffer.render(false), "a c");
        assert_eq!(buffer.raw(), "ab\x7f c");
    }

    #[test]
    fn test_erase_whole_earlier_chunk() {
        let mut buffer = TerminalBuffer::default();
        buffer.append(b"ab");
        buffer.append(b"\x7f\x7f c");
        assert_eq!(buffer.render(false), " c");
    }

    #[test]
    fn test_render_cursor_glyph() {
        let mut buffer = TerminalBuffer::new('_');
        buffer.append(b"$ ");
        assert_eq!(buffer.render(true), "$ _");
        assert_eq!(buffer.render(false), "$ ");

        assert!(!buffer.toggle_cursor());
        assert_eq!(buffer.snapshot(), "$ ");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut buffer = TerminalBuffer::default();
        buffer.append(b"ok\xffok");
        assert_eq!(buffer.render(false), "ok\u{fffd}ok");
    }

    #[test]
    fn test_split_multibyte_character() {
        let mut buffer = TerminalBuffer::default();
        let bytes = "é".as_bytes();
        buffer.append(&bytes[..1]);
        assert_eq!(buffer.render(false), "");
        buffer.append(&bytes[1..]);
        assert_eq!(buffer.render(false), "é");
    }

    #[test]
    fn test_clear_resets() {
        let mut buffer = TerminalBuffer::default();
        buffer.append(b"some output");
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.render(false), "");
    }

    proptest! {
        #[test]
        fn prop_render_is_normalized_and_stable(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8)
        ) {
            let mut buffer = TerminalBuffer::default();
            for chunk in &chunks {
                buffer.append(chunk);
            }
            let shown = buffer.render(false);
            prop_assert_eq!(normalize(&shown), shown.clone());
            prop_assert!(!shown.contains(BACKSPACE) && !shown.contains(DELETE));
        }

        #[test]
        fn prop_chunking_does_not_change_output(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8)
        ) {
            let mut chunked = TerminalBuffer::default();
            let mut whole = TerminalBuffer::default();
            for chunk in &chunks {
                chunked.append(chunk);
            }
            whole.append(&chunks.concat());
            prop_assert_eq!(chunked.render(false), whole.render(false));
        }

        #[test]
        fn prop_delete_erases_previous_chunk_tail(head in "[a-z ]{1,32}", tail in "[a-z ]{0,32}") {
            let mut buffer = TerminalBuffer::default();
            buffer.append(head.as_bytes());
            buffer.append(format!("\x7f{}", tail).as_bytes());
            let expected = format!("{}{}", &head[..head.len() - 1], tail);
            prop_assert_eq!(buffer.render(false), expected);
        }
    }
}
