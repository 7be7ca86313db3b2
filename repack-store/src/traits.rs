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

use bytes::Bytes;
use repack_common::{ObjectRef, Result};

/// Metadata returned by [ObjectStore::head].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64
}

/// A part accepted by the store during a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based, as the store numbers them
    pub part_number: u32,
    pub etag: String
}

/// The primitives repacking needs from an object store.
///
/// Calls block the current thread. Implementations are shared between the
/// request handlers and the multipart copy workers, hence `Send + Sync`.
pub trait ObjectStore: Send + Sync {
    /// Looks up the object's size without fetching content.
    fn head(&self, object: &ObjectRef) -> Result<ObjectMeta>;

    /// Fetches `[start, end)` of the object.
    fn get_range(&self, object: &ObjectRef, start: u64, end: u64) -> Result<Bytes>;

    /// Replaces the object with `data` in one request.
    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<()>;

    /// Starts a multipart upload and returns its upload id.
    fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String>;

    /// Uploads `data` as part `part_number` of the upload.
    fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes
    ) -> Result<CompletedPart>;

    /// Server-side copy of `[start, end)` of `source` into part `part_number`.
    fn upload_part_copy(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        source: &ObjectRef,
        start: u64,
        end: u64
    ) -> Result<CompletedPart>;

    /// Assembles the object from `parts`, which must be in ascending order.
    fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart]
    ) -> Result<()>;

    /// Discards an unfinished upload and any parts stored for it.
    fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()>;
}
