//! Conversion between protocol positions and byte offsets.
//!
//! Positions count UTF-16 code units. Lines end at `\n`, `\r\n` or a lone
//! `\r`; the terminator is not part of the line.

use crate::types::Position;

/// Byte range of a line's content, excluding its terminator.
fn line_bounds(text: &str, line: u32) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut current = 0;

    loop {
        let mut end = start;
        while end < bytes.len() && bytes[end] != b'\n' && bytes[end] != b'\r' {
            end += 1;
        }
        if current == line {
            return Some((start, end));
        }
        if end == bytes.len() {
            return None;
        }
        start = if bytes[end] == b'\r' && bytes.get(end + 1) == Some(&b'\n') {
            end + 2
        } else {
            end + 1
        };
        current += 1;
    }
}

/// Converts a position into a byte offset into `text`.
///
/// A character past the end of its line clamps to the line end and a line
/// past the last line maps to the end of the text. A position inside a
/// surrogate pair snaps to the start of that character.
#[must_use]
pub fn offset_at(text: &str, position: Position) -> usize {
    let Some((start, end)) = line_bounds(text, position.line) else {
        return text.len();
    };

    let mut units = 0u32;
    for (idx, ch) in text[start..end].char_indices() {
        let width = ch.len_utf16() as u32;
        if units + width > position.character {
            return start + idx;
        }
        units += width;
    }
    end
}

/// Converts a byte offset into a position.
///
/// Offsets past the end of the text, or inside a multi-byte character,
/// are moved back to the nearest character boundary.
#[must_use]
pub fn position_at(text: &str, offset: usize) -> Position {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }

    let mut line = 0u32;
    let mut line_start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < offset {
        match bytes[i] {
            b'\n' => {
                line += 1;
                line_start = i + 1;
            }
            b'\r' => {
                if bytes.get(i + 1) == Some(&b'\n') {
                    if i + 1 >= offset {
                        break;
                    }
                    i += 1;
                }
                line += 1;
                line_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    let character = text[line_start..offset.max(line_start)]
        .chars()
        .map(|c| c.len_utf16() as u32)
        .sum();
    Position::new(line, character)
}
