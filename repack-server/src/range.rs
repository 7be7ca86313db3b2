// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use repack_api::{RepackError, RepackResult, Result};

/// Largest span a single request may ask for.
pub const MAX_RANGE_SPAN: u64 = 50 * 1024 * 1024;

/// An inclusive `bytes=<start>-<end>` range as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64
}

fn parse_offset(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

impl ByteRange {
    /// Parses a `Range` header. Only a single closed range is accepted.
    pub fn parse(header: Option<&str>) -> Result<ByteRange> {
        let header = header.ok_or_else(|| RepackError::InvalidRange("missing Range header".into()))?;
        let invalid = || RepackError::InvalidRange(format!("{header:?}, expected bytes=<start>-<end>"));
        let (start, end) = header
            .strip_prefix("bytes=")
            .and_then(|bounds| bounds.split_once('-'))
            .ok_or_else(invalid)?;
        let start = parse_offset(start).ok_or_else(invalid)?;
        let end = parse_offset(end).ok_or_else(invalid)?;
        if end < start {
            return Err(RepackError::InvalidRange(format!("{header:?} ends before it starts")));
        }
        let span = end - start + 1;
        if span > MAX_RANGE_SPAN {
            return Err(RepackError::InvalidRange(format!(
                "{header:?} spans {span} bytes, at most {MAX_RANGE_SPAN} are served at once"
            )));
        }
        Ok(ByteRange { start, end })
    }
}

/// How one range request is answered from the remote prefix and the footer.
///
/// All ranges here are half open. `footer` is relative to the start of the
/// footer file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServePlan {
    pub start: u64,
    pub end: u64,
    pub total: u64,
    pub remote: Option<(u64, u64)>,
    pub footer: Option<(u64, u64)>
}

impl ServePlan {
    /// Clamps `range` to the repacked package and splits it at the footer.
    pub fn new(range: ByteRange, result: &RepackResult) -> Result<ServePlan> {
        let total = result.total_size();
        let split = result.split_offset;
        if range.start >= total {
            return Err(RepackError::InvalidRange(format!(
                "start {} is beyond the package size {total}",
                range.start
            )));
        }
        let start = range.start;
        let end = range.end.saturating_add(1).min(total);

        let remote = (start < split).then(|| (start, end.min(split)));
        let footer = (end > split).then(|| (start.saturating_sub(split), end - split));
        Ok(ServePlan {
            start,
            end,
            total,
            remote,
            footer
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the plan covers the whole package, answered with 200.
    pub fn is_complete(&self) -> bool {
        self.start == 0 && self.end == self.total
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end - 1, self.total)
    }
}
