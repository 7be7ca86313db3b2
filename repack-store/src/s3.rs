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

use std::future::Future;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart},
    Client
};
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use repack_common::{ObjectRef, RepackError, Result};
use tokio::runtime::Handle;
use tracing::instrument;

use crate::traits::{CompletedPart, ObjectMeta, ObjectStore};

/// Connection settings for [S3Store]. Credentials come from the environment.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub region: Option<String>,
    /// S3-compatible endpoint such as an OSS or MinIO URL.
    pub endpoint: Option<String>,
    /// Use `endpoint/bucket/key` URLs instead of virtual-hosted buckets.
    pub force_path_style: bool
}

/// [ObjectStore] backed by the AWS SDK.
///
/// The SDK is async, the store trait is not: every call is driven to
/// completion on `runtime`, so methods must be called from outside the
/// runtime's worker threads (a `spawn_blocking` task or a plain thread).
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    runtime: Handle
}

fn sdk_error<E>(operation: &'static str, object: &ObjectRef, err: E) -> RepackError
where
    E: std::error::Error
{
    RepackError::store(operation, object, DisplayErrorContext(err))
}

/// Like [sdk_error], but tells definite answers from the store (missing
/// object, other client errors) apart from failures worth retrying.
fn request_error<E>(operation: &'static str, object: &ObjectRef, err: SdkError<E>) -> RepackError
where
    E: std::error::Error + 'static
{
    match err.raw_response().map(|raw| raw.status().as_u16()) {
        Some(404) => RepackError::not_found(operation, object),
        Some(status @ 400..=499) if status != 408 && status != 429 => RepackError::StoreRejected {
            operation,
            object: object.to_string(),
            status,
            message: DisplayErrorContext(err).to_string()
        },
        _ => sdk_error(operation, object, err)
    }
}

impl S3Store {
    /// Builds a client from the ambient AWS configuration. Must be called
    /// within the runtime that will drive the requests.
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        S3Store::from_client(Client::from_conf(builder.build()), Handle::current())
    }

    pub fn from_client(client: Client, runtime: Handle) -> Self {
        S3Store { client, runtime }
    }

    fn run<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(backend = "s3"))]
    fn head(&self, object: &ObjectRef) -> Result<ObjectMeta> {
        let output = self
            .run(
                self.client
                    .head_object()
                    .bucket(&object.bucket)
                    .key(&object.key)
                    .send()
            )
            .map_err(|e| request_error("head_object", object, e))?;
        let size = output
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| RepackError::store("head_object", object, "missing content length"))?;
        Ok(ObjectMeta { size })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    fn get_range(&self, object: &ObjectRef, start: u64, end: u64) -> Result<Bytes> {
        if start >= end {
            return Ok(Bytes::new());
        }
        // Range ends are inclusive on the wire
        let range = format!("bytes={}-{}", start, end - 1);
        self.run(async {
            let output = self
                .client
                .get_object()
                .bucket(&object.bucket)
                .key(&object.key)
                .range(range)
                .send()
                .await
                .map_err(|e| request_error("get_object", object, e))?;
            let body = output
                .body
                .collect()
                .await
                .map_err(|e| sdk_error("get_object", object, e))?;
            Ok(body.into_bytes())
        })
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        self.run(
            self.client
                .put_object()
                .bucket(&object.bucket)
                .key(&object.key)
                .body(ByteStream::from(data))
                .send()
        )
        .map_err(|e| request_error("put_object", object, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        let output = self
            .run(
                self.client
                    .create_multipart_upload()
                    .bucket(&object.bucket)
                    .key(&object.key)
                    .send()
            )
            .map_err(|e| request_error("create_multipart_upload", object, e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| RepackError::store("create_multipart_upload", object, "missing upload id"))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes
    ) -> Result<CompletedPart> {
        let output = self
            .run(
                self.client
                    .upload_part()
                    .bucket(&object.bucket)
                    .key(&object.key)
                    .upload_id(upload_id)
                    .part_number(part_number as i32)
                    .body(ByteStream::from(data))
                    .send()
            )
            .map_err(|e| request_error("upload_part", object, e))?;
        Ok(CompletedPart {
            part_number,
            etag: output.e_tag().unwrap_or_default().to_string()
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    fn upload_part_copy(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        source: &ObjectRef,
        start: u64,
        end: u64
    ) -> Result<CompletedPart> {
        // The key is percent-encoded, the bucket and separator are not
        let copy_source = format!(
            "{}/{}",
            source.bucket,
            utf8_percent_encode(&source.key, NON_ALPHANUMERIC)
        );
        let output = self
            .run(
                self.client
                    .upload_part_copy()
                    .bucket(&object.bucket)
                    .key(&object.key)
                    .upload_id(upload_id)
                    .part_number(part_number as i32)
                    .copy_source(copy_source)
                    .copy_source_range(format!("bytes={}-{}", start, end.saturating_sub(1)))
                    .send()
            )
            .map_err(|e| request_error("upload_part_copy", object, e))?;
        let etag = output
            .copy_part_result()
            .and_then(|result| result.e_tag())
            .unwrap_or_default()
            .to_string();
        Ok(CompletedPart { part_number, etag })
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart]
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        S3CompletedPart::builder()
                            .part_number(part.part_number as i32)
                            .e_tag(&part.etag)
                            .build()
                    })
                    .collect()
            ))
            .build();
        self.run(
            self.client
                .complete_multipart_upload()
                .bucket(&object.bucket)
                .key(&object.key)
                .upload_id(upload_id)
                .multipart_upload(completed)
                .send()
        )
        .map_err(|e| request_error("complete_multipart_upload", object, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.run(
            self.client
                .abort_multipart_upload()
                .bucket(&object.bucket)
                .key(&object.key)
                .upload_id(upload_id)
                .send()
        )
        .map_err(|e| request_error("abort_multipart_upload", object, e))?;
        Ok(())
    }
}
