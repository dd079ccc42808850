//! Text chunker — splits long input into provider-sized pieces.
//!
//! Speech providers cap the input of a single request (OpenAI's
//! `/audio/speech` accepts 4 096 characters), so a long text is cut into
//! consecutive chunks of at most `max_len` characters.  A cut is placed right
//! after the last `.` inside the window when one exists, otherwise at the hard
//! length boundary.
//!
//! The chunks partition the input: concatenating them in order yields the
//! original text byte for byte.  Nothing is trimmed, re-punctuated or dropped,
//! so the narration of the joined audio is exactly the narration of the text.

/// Default maximum characters per chunk.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 4_000;

/// Split `text` into ordered, non-empty chunks of at most `max_len` chars.
///
/// Lengths are counted in Unicode scalar values and every cut falls on a
/// char boundary.  `max_len == 0` is treated as `1`.  Empty input yields no
/// chunks.
pub fn split(text: &str, max_len: usize) -> Vec<&str> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let rest = &text[start..];

        // Byte offset (relative to `start`) of the window end.
        let window_end = match rest.char_indices().nth(max_len) {
            Some((offset, _)) => offset,
            None => rest.len(),
        };

        let cut = if window_end < rest.len() {
            // Period strictly after `start` → cut inclusive of it.
            match rest[..window_end].rfind('.') {
                Some(dot) if dot > 0 => dot + 1,
                _ => window_end,
            }
        } else {
            window_end
        };

        chunks.push(&rest[..cut]);
        start += cut;
    }

    chunks
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
