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

use std::fmt;

use crate::{RepackError, Result};

const MAX_CHANNEL_ID_LEN: usize = 128;

/// A `{bucket, key}` pair naming one object in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String
}

impl ObjectRef {
    /// Parses `bucket/key`. Only the first `/` separates the bucket, the key
    /// may contain more of them.
    pub fn parse(location: &str) -> Result<ObjectRef> {
        match location.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(ObjectRef {
                bucket: bucket.to_string(),
                key: key.to_string()
            }),
            _ => Err(RepackError::InvalidSource(location.to_string()))
        }
    }

    /// `bucket/key` flattened into something usable as a single file name.
    pub fn flattened(&self) -> String {
        format!("{}_{}", self.bucket, self.key.replace('/', "_"))
    }

    /// Name offered to downloaders: `<key file stem>_<channel>.apk`.
    pub fn download_name(&self, channel: &ChannelId) -> String {
        let file_name = self.key.rsplit('/').next().unwrap_or(&self.key);
        let stem = match file_name.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem,
            _ => file_name
        };
        format!("{stem}_{channel}.apk")
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Identifies the distribution channel written into a package.
///
/// Opaque text: any non-empty string of at most 128 bytes without control
/// characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn parse(value: &str) -> Result<ChannelId> {
        if value.is_empty() || value.len() > MAX_CHANNEL_ID_LEN || value.chars().any(char::is_control) {
            return Err(RepackError::InvalidChannel(value.to_string()));
        }
        Ok(ChannelId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
