//! HTTP byte ranges
//!
//! `Range` request values and `Content-Range` reply parsing for the
//! multi-connection downloader.

use std::fmt;

/// Inclusive byte range `start..=end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Never zero: both ends are inclusive
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Range` request header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// What a reply says about range support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeReply {
    /// No `Content-Range`: the body is the whole resource
    Whole,
    /// `bytes start-end/total`
    Partial { range: ByteRange, total: u64 },
    /// Present but unusable (`*/total`, unknown total, garbage)
    Invalid,
}

/// Parse a `Content-Range` header value
pub fn parse_content_range(header: Option<&str>) -> RangeReply {
    let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) else {
        return RangeReply::Whole;
    };
    let Some(spec) = value.strip_prefix("bytes ") else {
        return RangeReply::Invalid;
    };
    let Some((range, total)) = spec.trim().split_once('/') else {
        return RangeReply::Invalid;
    };
    let Ok(total) = total.trim().parse::<u64>() else {
        return RangeReply::Invalid;
    };
    let Some((start, end)) = range.trim().split_once('-') else {
        return RangeReply::Invalid;
    };
    match (start.trim().parse::<u64>(), end.trim().parse::<u64>()) {
        (Ok(start), Ok(end)) if start <= end && end < total => RangeReply::Partial {
            range: ByteRange::new(start, end),
            total,
        },
        _ => RangeReply::Invalid,
    }
}

/// Split `start..=end` into `count` contiguous blocks; the last block takes
/// the remainder
pub fn partition(start: u64, end: u64, count: usize) -> Vec<ByteRange> {
    if start > end {
        return Vec::new();
    }
    let len = (end - start).saturating_add(1);
    let count = (count.max(1) as u64).min(len);
    let block = len.div_ceil(count);
    let mut blocks = Vec::with_capacity(count as usize);
    let mut offset = start;
    loop {
        let block_end = offset.saturating_add(block - 1).min(end);
        blocks.push(ByteRange::new(offset, block_end));
        if block_end == end {
            break;
        }
        offset = block_end + 1;
    }
    blocks
}
