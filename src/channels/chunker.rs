//! Splitting long text into message-sized chunks.
//!
//! Lengths are counted in `char`s, which is how Discord counts its 2000
//! character limit, so multi-byte text never gets cut mid code point.

use crate::error::{Error, Result};

/// Discord's maximum message length
pub const DISCORD_MAX_MESSAGE_LEN: usize = 2000;

/// Split `text` into chunks of at most `max_len` characters.
///
/// Each chunk breaks at the last paragraph break, line break or space inside
/// the window, in that order of preference. A break in the front half of the
/// window is ignored and the text is cut at exactly `max_len` instead.
/// Whitespace at the start of the following chunk is dropped. Empty input
/// yields no chunks.
pub fn split_message(text: &str, max_len: usize) -> Result<Vec<String>> {
    if max_len == 0 {
        return Err(Error::invalid("chunk length must be at least 1"));
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let window_end = match remaining.char_indices().nth(max_len) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let (chunk_end, next_start) = find_break(remaining, window_end, max_len);
        chunks.push(remaining[..chunk_end].to_string());
        remaining = remaining[next_start..].trim_start();
    }

    Ok(chunks)
}

/// Pick the cut for one window. Returns (end of chunk, start of remainder)
/// as byte offsets into `text`; `window_end` is the byte offset of the
/// first character past the window.
fn find_break(text: &str, window_end: usize, max_len: usize) -> (usize, usize) {
    let window = &text[..window_end];

    for sep in ["\n\n", "\n", " "] {
        if let Some(pos) = window.rfind(sep) {
            // Breaks too early in the window produce tiny chunks; skip them.
            if pos > 0 && 2 * window[..pos].chars().count() >= max_len {
                return (pos, pos + sep.len());
            }
        }
    }

    (window_end, window_end)
}
