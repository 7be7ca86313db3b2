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

use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc
};

use bytes::Bytes;
use repack_common::{ObjectRef, RepackError, Result};
use tracing::{debug, trace};

use crate::traits::ObjectStore;

/// Minimum number of bytes fetched by a single ranged GET.
pub const READ_AHEAD_WINDOW: u64 = 4 * 1024 * 1024;

/// Random access to a remote object through a single read-ahead window.
///
/// ZIP parsing jumps between the tail of the archive and individual entries,
/// so every miss fetches at least [READ_AHEAD_WINDOW] bytes and keeps them
/// until the next miss.
pub struct RangedRemoteReader {
    store: Arc<dyn ObjectStore>,
    object: ObjectRef,
    size: u64,
    /// `(offset, bytes)` of the current window
    cache: Option<(u64, Bytes)>,
    position: u64
}

impl RangedRemoteReader {
    /// Looks the object up. Fails if it does not exist.
    pub fn open(store: Arc<dyn ObjectStore>, object: ObjectRef) -> Result<Self> {
        let size = store.head(&object)?.size;
        debug!(%object, size, "opened remote object");
        Ok(RangedRemoteReader {
            store,
            object,
            size,
            cache: None,
            position: 0
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fills `buf` with the bytes at `offset`, or fails.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let end = offset.checked_add(len).filter(|end| *end <= self.size);
        let Some(end) = end else {
            self.cache = None;
            return Err(self.short_read(offset, len, self.size.saturating_sub(offset)));
        };

        if let Some((start, window)) = &self.cache {
            if offset >= *start && end <= start + window.len() as u64 {
                let from = (offset - start) as usize;
                buf.copy_from_slice(&window[from..from + buf.len()]);
                return Ok(());
            }
        }

        let fetch_end = (offset + len.max(READ_AHEAD_WINDOW)).min(self.size);
        trace!(object = %self.object, offset, fetch_end, "window miss");
        let window = match self.store.get_range(&self.object, offset, fetch_end) {
            Ok(window) => window,
            Err(e) => {
                self.cache = None;
                return Err(e);
            }
        };
        if (window.len() as u64) < len {
            self.cache = None;
            return Err(self.short_read(offset, len, window.len() as u64));
        }
        buf.copy_from_slice(&window[..buf.len()]);
        self.cache = Some((offset, window));
        Ok(())
    }

    /// Reads `len` bytes at `offset` into a fresh buffer.
    pub fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn short_read(&self, offset: u64, expected: u64, actual: u64) -> RepackError {
        RepackError::ShortRead {
            object: self.object.to_string(),
            offset,
            expected,
            actual
        }
    }
}

impl Read for RangedRemoteReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.position);
        let n = remaining.min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.read_at(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for RangedRemoteReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta)
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.position = target;
        Ok(target)
    }
}
