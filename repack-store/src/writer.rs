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
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
    thread
};

use bytes::Bytes;
use repack_common::{ObjectRef, RepackError, Result};
use tracing::{debug, info, warn};

use crate::traits::{CompletedPart, ObjectStore};

pub const DEFAULT_PART_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MIN_PART_SIZE: u64 = 100 * 1024;
pub const DEFAULT_WORKERS: usize = 8;
/// Buffered suffixes beyond this size are logged, they are held in memory.
pub const MAX_WRITE_BUFFER: usize = 100 * 1024 * 1024;

/// Tuning for [MultipartRemoteWriter].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartConfig {
    /// Largest prefix slice copied into a single part.
    pub part_size: u64,
    /// Prefixes below this are downloaded and re-uploaded in one put, and a
    /// trailing remainder up to this size is merged into the previous part.
    pub min_part_size: u64,
    /// Number of concurrent part copies.
    pub workers: usize
}

impl Default for MultipartConfig {
    fn default() -> Self {
        MultipartConfig {
            part_size: DEFAULT_PART_SIZE,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            workers: DEFAULT_WORKERS
        }
    }
}

/// One server-side copy job: bytes `[start, start + size)` of the source
/// become part `index` of the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPart {
    /// 1-based
    pub index: u32,
    pub start: u64,
    pub size: u64
}

/// Splits `[0, offset)` into `ceil(offset / part_size)` parts. A non-empty
/// remainder of at most `min_part_size` is folded into the part before it
/// when there is one.
pub fn plan_parts(offset: u64, part_size: u64, min_part_size: u64) -> Vec<UploadPart> {
    let part_size = part_size.max(1);
    let count = offset.div_ceil(part_size);
    let mut parts: Vec<UploadPart> = (0..count)
        .map(|i| {
            let start = i * part_size;
            UploadPart {
                index: (i + 1) as u32,
                start,
                size: part_size.min(offset - start)
            }
        })
        .collect();

    let remainder = offset % part_size;
    if parts.len() > 1 && remainder != 0 && remainder <= min_part_size {
        if let Some(last) = parts.pop() {
            if let Some(previous) = parts.last_mut() {
                previous.size += last.size;
            }
        }
    }
    parts
}

/// Writes `dest` as the first `offset` bytes of `source` followed by
/// everything written to this writer.
///
/// Nothing reaches the store until [MultipartRemoteWriter::commit]. Large
/// prefixes are never transferred through this process: they are copied
/// server-side, part by part, by a fixed pool of worker threads.
pub struct MultipartRemoteWriter {
    store: Arc<dyn ObjectStore>,
    source: ObjectRef,
    dest: ObjectRef,
    offset: u64,
    config: MultipartConfig,
    buffer: Vec<u8>,
    warned: bool
}

impl MultipartRemoteWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        source: ObjectRef,
        dest: ObjectRef,
        offset: u64,
        config: MultipartConfig
    ) -> Self {
        MultipartRemoteWriter {
            store,
            source,
            dest,
            offset,
            config,
            buffer: Vec::new(),
            warned: false
        }
    }

    /// Commits the destination object.
    ///
    /// On failure the destination is left untouched. A multipart session that
    /// was already created is aborted.
    pub fn commit(self) -> Result<()> {
        if self.offset < self.config.min_part_size {
            return self.put_whole();
        }

        info!(dest = %self.dest, offset = self.offset, "begin multipart copy");
        let upload_id = self.store.create_multipart_upload(&self.dest)?;
        match self.upload_all(&upload_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = self.store.abort_multipart_upload(&self.dest, &upload_id) {
                    warn!(dest = %self.dest, %upload_id, error = %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }

    fn put_whole(self) -> Result<()> {
        debug!(dest = %self.dest, offset = self.offset, "small prefix, single put");
        let mut data = Vec::with_capacity(self.offset as usize + self.buffer.len());
        if self.offset > 0 {
            let prefix = self.store.get_range(&self.source, 0, self.offset)?;
            if prefix.len() as u64 != self.offset {
                return Err(RepackError::ShortRead {
                    object: self.source.to_string(),
                    offset: 0,
                    expected: self.offset,
                    actual: prefix.len() as u64
                });
            }
            data.extend_from_slice(&prefix);
        }
        data.extend_from_slice(&self.buffer);
        self.store.put(&self.dest, data.into())
    }

    fn upload_all(&self, upload_id: &str) -> Result<()> {
        let plan = plan_parts(self.offset, self.config.part_size, self.config.min_part_size);
        let mut parts = self.copy_parts(upload_id, &plan)?;

        let suffix_number = plan.len() as u32 + 1;
        let suffix = Bytes::copy_from_slice(&self.buffer);
        parts.push(
            self.store
                .upload_part(&self.dest, upload_id, suffix_number, suffix)?
        );

        self.store
            .complete_multipart_upload(&self.dest, upload_id, &parts)?;
        info!(dest = %self.dest, parts = parts.len(), "multipart upload completed");
        Ok(())
    }

    /// Runs every copy job and returns the parts in ascending order, or the
    /// error of the lowest failing part. Results are only looked at once all
    /// workers have drained the queue.
    fn copy_parts(&self, upload_id: &str, plan: &[UploadPart]) -> Result<Vec<CompletedPart>> {
        let queue = Mutex::new(plan.iter().copied().collect::<VecDeque<_>>());
        let results = Mutex::new(Vec::with_capacity(plan.len()));
        let workers = self.config.workers.clamp(1, plan.len().max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(part) = next else { break };
                    let result = self.store.upload_part_copy(
                        &self.dest,
                        upload_id,
                        part.index,
                        &self.source,
                        part.start,
                        part.start + part.size
                    );
                    if let Err(e) = &result {
                        warn!(part = part.index, error = %e, "part copy failed");
                    }
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((part.index, result));
                });
            }
        });

        let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

impl Write for MultipartRemoteWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if !self.warned && self.buffer.len() > MAX_WRITE_BUFFER {
            warn!(buffered = self.buffer.len(), "max write buffer exceeded");
            self.warned = true;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
