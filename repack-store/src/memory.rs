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
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError
    }
};

use bytes::Bytes;
use repack_common::{ObjectRef, RepackError, Result};

use crate::traits::{CompletedPart, ObjectMeta, ObjectStore};

/// Number of calls a [MemoryStore] has served, per primitive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreCalls {
    pub head: usize,
    pub get_range: usize,
    pub put: usize,
    pub create_multipart_upload: usize,
    pub upload_part: usize,
    pub upload_part_copy: usize,
    pub complete_multipart_upload: usize,
    pub abort_multipart_upload: usize
}

impl StoreCalls {
    pub fn total(&self) -> usize {
        self.head
            + self.get_range
            + self.put
            + self.create_multipart_upload
            + self.upload_part
            + self.upload_part_copy
            + self.complete_multipart_upload
            + self.abort_multipart_upload
    }

    /// Calls that belong to a multipart session.
    pub fn multipart(&self) -> usize {
        self.create_multipart_upload
            + self.upload_part
            + self.upload_part_copy
            + self.complete_multipart_upload
            + self.abort_multipart_upload
    }
}

#[derive(Default)]
struct Counters {
    head: AtomicUsize,
    get_range: AtomicUsize,
    put: AtomicUsize,
    create_multipart_upload: AtomicUsize,
    upload_part: AtomicUsize,
    upload_part_copy: AtomicUsize,
    complete_multipart_upload: AtomicUsize,
    abort_multipart_upload: AtomicUsize
}

struct PendingUpload {
    object: ObjectRef,
    parts: BTreeMap<u32, Bytes>
}

/// An object store held entirely in memory.
///
/// Counts every call and can be told to fail specific part copies, which makes
/// it the backend for tests and for trying the pipeline without a bucket.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectRef, Bytes>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    failing_copy_parts: Mutex<HashSet<u32>>,
    next_upload_id: AtomicU64,
    counters: Counters
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: &ObjectRef, data: impl Into<Bytes>) {
        lock(&self.objects).insert(object.clone(), data.into());
    }

    pub fn object(&self, object: &ObjectRef) -> Option<Bytes> {
        lock(&self.objects).get(object).cloned()
    }

    /// Makes every later copy into part `part_number` fail.
    pub fn fail_part_copy(&self, part_number: u32) {
        lock(&self.failing_copy_parts).insert(part_number);
    }

    /// Uploads that were created but neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        lock(&self.uploads).len()
    }

    pub fn calls(&self) -> StoreCalls {
        let c = &self.counters;
        StoreCalls {
            head: c.head.load(Ordering::SeqCst),
            get_range: c.get_range.load(Ordering::SeqCst),
            put: c.put.load(Ordering::SeqCst),
            create_multipart_upload: c.create_multipart_upload.load(Ordering::SeqCst),
            upload_part: c.upload_part.load(Ordering::SeqCst),
            upload_part_copy: c.upload_part_copy.load(Ordering::SeqCst),
            complete_multipart_upload: c.complete_multipart_upload.load(Ordering::SeqCst),
            abort_multipart_upload: c.abort_multipart_upload.load(Ordering::SeqCst)
        }
    }

    fn slice(&self, operation: &'static str, object: &ObjectRef, start: u64, end: u64) -> Result<Bytes> {
        let objects = lock(&self.objects);
        let data = objects
            .get(object)
            .ok_or_else(|| RepackError::not_found(operation, object))?;
        if start > end || end > data.len() as u64 {
            return Err(RepackError::StoreRejected {
                operation,
                object: object.to_string(),
                status: 416,
                message: format!("range {start}-{end} not satisfiable for {} bytes", data.len())
            });
        }
        Ok(data.slice(start as usize..end as usize))
    }

    fn stage_part(
        &self,
        operation: &'static str,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes
    ) -> Result<CompletedPart> {
        let mut uploads = lock(&self.uploads);
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| &u.object == object)
            .ok_or_else(|| RepackError::store(operation, object, "no such upload"))?;
        let etag = format!("\"{part_number}-{}\"", data.len());
        upload.parts.insert(part_number, data);
        Ok(CompletedPart { part_number, etag })
    }
}

impl ObjectStore for MemoryStore {
    fn head(&self, object: &ObjectRef) -> Result<ObjectMeta> {
        self.counters.head.fetch_add(1, Ordering::SeqCst);
        lock(&self.objects)
            .get(object)
            .map(|data| ObjectMeta {
                size: data.len() as u64
            })
            .ok_or_else(|| RepackError::not_found("head_object", object))
    }

    fn get_range(&self, object: &ObjectRef, start: u64, end: u64) -> Result<Bytes> {
        self.counters.get_range.fetch_add(1, Ordering::SeqCst);
        self.slice("get_object", object, start, end)
    }

    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        self.counters.put.fetch_add(1, Ordering::SeqCst);
        self.insert(object, data);
        Ok(())
    }

    fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        self.counters
            .create_multipart_upload
            .fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("upload-{}", self.next_upload_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.uploads).insert(
            upload_id.clone(),
            PendingUpload {
                object: object.clone(),
                parts: BTreeMap::new()
            }
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes
    ) -> Result<CompletedPart> {
        self.counters.upload_part.fetch_add(1, Ordering::SeqCst);
        self.stage_part("upload_part", object, upload_id, part_number, data)
    }

    fn upload_part_copy(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        source: &ObjectRef,
        start: u64,
        end: u64
    ) -> Result<CompletedPart> {
        self.counters.upload_part_copy.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_copy_parts).contains(&part_number) {
            return Err(RepackError::store(
                "upload_part_copy",
                object,
                format!("injected failure for part {part_number}")
            ));
        }
        let data = self.slice("upload_part_copy", source, start, end)?;
        self.stage_part("upload_part_copy", object, upload_id, part_number, data)
    }

    fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart]
    ) -> Result<()> {
        self.counters
            .complete_multipart_upload
            .fetch_add(1, Ordering::SeqCst);
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(RepackError::store(
                "complete_multipart_upload",
                object,
                "parts must be listed in ascending order"
            ));
        }
        let mut uploads = lock(&self.uploads);
        let upload = uploads
            .remove(upload_id)
            .filter(|u| &u.object == object)
            .ok_or_else(|| RepackError::store("complete_multipart_upload", object, "no such upload"))?;

        let mut assembled = Vec::new();
        for part in parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                RepackError::store(
                    "complete_multipart_upload",
                    object,
                    format!("part {} was never uploaded", part.part_number)
                )
            })?;
            assembled.extend_from_slice(data);
        }
        drop(uploads);
        self.insert(object, assembled);
        Ok(())
    }

    fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.counters
            .abort_multipart_upload
            .fetch_add(1, Ordering::SeqCst);
        lock(&self.uploads)
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| RepackError::store("abort_multipart_upload", object, "no such upload"))
    }
}
