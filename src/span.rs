//! Byte offset to line/column normalization.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A location in a file. `line_number <= 0` means the line is unknown and
/// only `byte_offset` is meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Point {
    pub byte_offset: i64,
    pub line_number: i64,
    pub column_offset: i64,
}

impl Point {
    pub fn unknown(byte_offset: i64) -> Self {
        Point {
            byte_offset,
            line_number: 0,
            column_offset: 0,
        }
    }

    pub fn is_known(&self) -> bool {
        self.line_number > 0
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Span {
    pub start: Point,
    pub end: Point,
}

impl Span {
    pub fn unknown(start: i64, end: i64) -> Self {
        Span {
            start: Point::unknown(start),
            end: Point::unknown(end),
        }
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start.byte_offset <= other.start.byte_offset
            && other.end.byte_offset <= self.end.byte_offset
    }
}

/// Offset outside `[0, len]`. Carries the clamped point so callers can keep
/// going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("byte offset {offset} outside of text (length {len})")]
pub struct OutOfRange {
    pub offset: i64,
    pub len: i64,
    pub clamped: Point,
}

/// Line-start table for one file's text, built once and shared by every
/// anchor in that file.
#[derive(Debug, Clone)]
pub struct Normalizer {
    len: i64,
    line_starts: Vec<i64>,
}

impl Normalizer {
    pub fn new(text: &[u8]) -> Self {
        let mut line_starts = vec![0];
        for (idx, byte) in text.iter().enumerate() {
            if *byte == b'\n' {
                line_starts.push(idx as i64 + 1);
            }
        }
        Normalizer {
            len: text.len() as i64,
            line_starts,
        }
    }

    pub fn text_len(&self) -> i64 {
        self.len
    }

    /// Number of lines, counting the (possibly empty) segment after the last
    /// newline.
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    pub fn point(&self, offset: i64) -> Result<Point, OutOfRange> {
        let clamped = offset.clamp(0, self.len);
        let point = self.locate(clamped);
        if clamped == offset {
            Ok(point)
        } else {
            Err(OutOfRange {
                offset,
                len: self.len,
                clamped: point,
            })
        }
    }

    /// Normalize both ends. The first out-of-range end, if any, is reported
    /// alongside the clamped span.
    pub fn span(&self, start: i64, end: i64) -> (Span, Option<OutOfRange>) {
        let mut error = None;
        let mut settle = |result: Result<Point, OutOfRange>| match result {
            Ok(point) => point,
            Err(err) => {
                let point = err.clamped;
                error.get_or_insert(err);
                point
            }
        };
        let span = Span {
            start: settle(self.point(start)),
            end: settle(self.point(end)),
        };
        (span, error)
    }

    /// Byte bounds of a 1-based line, excluding its newline.
    pub fn line_bounds(&self, line_number: i64) -> Option<(i64, i64)> {
        if line_number < 1 {
            return None;
        }
        let idx = (line_number - 1) as usize;
        let start = *self.line_starts.get(idx)?;
        let end = match self.line_starts.get(idx + 1) {
            Some(next) => next - 1,
            None => self.len,
        };
        Some((start, end))
    }

    /// Full text of the line containing `point` and the span covering it.
    pub fn line_snippet<'t>(&self, text: &'t [u8], point: &Point) -> Option<(Cow<'t, str>, Span)> {
        let line_number = if point.is_known() {
            point.line_number
        } else {
            self.point(point.byte_offset).ok()?.line_number
        };
        let (start, mut end) = self.line_bounds(line_number)?;
        let bytes = text.get(start as usize..end as usize)?;
        let bytes = match bytes.strip_suffix(b"\r") {
            Some(trimmed) => {
                end -= 1;
                trimmed
            }
            None => bytes,
        };
        let span = Span {
            start: self.locate(start),
            end: self.locate(end),
        };
        Some((String::from_utf8_lossy(bytes), span))
    }

    fn locate(&self, offset: i64) -> Point {
        let idx = self
            .line_starts
            .partition_point(|start| *start <= offset)
            .saturating_sub(1);
        Point {
            byte_offset: offset,
            line_number: idx as i64 + 1,
            column_offset: offset - self.line_starts[idx],
        }
    }
}

/// Normalize a byte range against an optional normalizer. Without text every
/// point keeps only its byte offset.
pub fn normalize_span(
    normalizer: Option<&Normalizer>,
    start: i64,
    end: i64,
) -> (Span, Option<OutOfRange>) {
    match normalizer {
        Some(normalizer) => normalizer.span(start, end),
        None => (Span::unknown(start, end), None),
    }
}
