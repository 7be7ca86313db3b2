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

use std::{thread, time::Duration};

use bytes::Bytes;
use repack_common::{ObjectRef, Result};
use tracing::warn;

use crate::traits::{CompletedPart, ObjectMeta, ObjectStore};

/// Backoff schedule for [RetryingStore].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0
        }
    }
}

impl RetryConfig {
    fn delay(&self, attempt: usize) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Retries the idempotent reads of the wrapped store.
///
/// Writes are passed through untouched: repeating a part upload or a
/// completion after an ambiguous failure could commit twice.
pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, RetryConfig::default())
    }

    pub fn with_config(inner: S, config: RetryConfig) -> Self {
        RetryingStore { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn retry<T>(&self, operation: &str, object: &ObjectRef, call: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match call() {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.delay(attempt);
                    warn!(
                        operation,
                        %object,
                        attempt = attempt + 1,
                        ?delay,
                        error = %e,
                        "store read failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other
            }
        }
    }
}

impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    fn head(&self, object: &ObjectRef) -> Result<ObjectMeta> {
        self.retry("head_object", object, || self.inner.head(object))
    }

    fn get_range(&self, object: &ObjectRef, start: u64, end: u64) -> Result<Bytes> {
        self.retry("get_object", object, || self.inner.get_range(object, start, end))
    }

    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        self.inner.put(object, data)
    }

    fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        self.inner.create_multipart_upload(object)
    }

    fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes
    ) -> Result<CompletedPart> {
        self.inner.upload_part(object, upload_id, part_number, data)
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
        self.inner
            .upload_part_copy(object, upload_id, part_number, source, start, end)
    }

    fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart]
    ) -> Result<()> {
        self.inner
            .complete_multipart_upload(object, upload_id, parts)
    }

    fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.inner.abort_multipart_upload(object, upload_id)
    }
}
