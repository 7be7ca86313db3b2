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
    fs::File,
    path::{Path, PathBuf}
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use repack_common::*;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

const MAX_PREFIX_LEN: usize = 160;

/// Path-safe rendition of `name`, truncated to `MAX_PREFIX_LEN` bytes.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_'
        })
        .take(MAX_PREFIX_LEN)
        .collect()
}

/// Where and how big the footer of a repacked package is.
///
/// The package is the source object's first `split_offset` bytes followed
/// by `footer_size` bytes of footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepackResult {
    #[serde(rename = "Offset")]
    pub split_offset: u64,
    #[serde(rename = "FooterSize")]
    pub footer_size: u64
}

impl RepackResult {
    pub fn total_size(&self) -> u64 {
        self.split_offset + self.footer_size
    }
}

/// A computed or cached result with its footer opened for reading.
#[derive(Debug)]
pub struct Repacked {
    pub result: RepackResult,
    pub footer: File
}

/// Scratch files of one `(source, channel)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchPaths {
    pub dir: PathBuf,
    pub footer: PathBuf,
    pub meta: PathBuf
}

impl ScratchPaths {
    /// The directory name carries a readable prefix and a digest of the
    /// whole `(bucket, key, channel)` tuple, so distinct pairs never share
    /// scratch files.
    pub fn new(work_dir: &Path, source: &ObjectRef, channel: &ChannelId) -> Self {
        let tuple = format!(
            "{}:{}{}:{}{}:{}",
            source.bucket.len(),
            source.bucket,
            source.key.len(),
            source.key,
            channel.as_str().len(),
            channel
        );
        let digest = URL_SAFE_NO_PAD.encode(Sha1::digest(tuple.as_bytes()));
        let prefix = sanitize(&format!("{}.{channel}", source.flattened()));
        let dir = work_dir.join(format!("{prefix}.{digest}"));
        let file_name = sanitize(source.key.rsplit('/').next().unwrap_or(&source.key));
        ScratchPaths {
            footer: dir.join(format!("{file_name}.footer")),
            meta: dir.join(format!("{file_name}.meta")),
            dir
        }
    }

    /// The cached result, if both the meta and the footer file exist.
    pub fn load(&self) -> Result<Option<Repacked>> {
        if !self.meta.is_file() || !self.footer.is_file() {
            return Ok(None);
        }
        let result: RepackResult = serde_json::from_slice(&std::fs::read(&self.meta)?)?;
        let footer = File::open(&self.footer)?;
        Ok(Some(Repacked { result, footer }))
    }

    /// Persists the footer, then the meta file that marks it complete.
    pub fn store(&self, result: &RepackResult, footer: &[u8]) -> Result<()> {
        write_atomic(&self.footer, footer)?;
        write_atomic(&self.meta, &serde_json::to_vec(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_uses_the_wire_field_names() {
        let result = RepackResult {
            split_offset: 1024,
            footer_size: 77
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"Offset":1024,"FooterSize":77}"#);
        assert_eq!(serde_json::from_str::<RepackResult>(&json).unwrap(), result);
        assert_eq!(result.total_size(), 1101);
    }

    #[test]
    fn scratch_layout_is_keyed_by_source_and_channel() {
        let source = ObjectRef::parse("apps/release/game.apk").unwrap();
        let channel = ChannelId::parse("huawei").unwrap();
        let paths = ScratchPaths::new(Path::new("/mnt/auto"), &source, &channel);
        assert_eq!(
            paths.dir,
            Path::new("/mnt/auto/apps_release_game.apk.huawei.YhIAsq-n-gd55OHaEtZN4XasVAg")
        );
        assert_eq!(paths.footer, paths.dir.join("game.apk.footer"));
        assert_eq!(paths.meta, paths.dir.join("game.apk.meta"));
    }

    #[test]
    fn flattened_lookalikes_get_distinct_scratch_dirs() {
        let work_dir = Path::new("/mnt/auto");
        let channel = ChannelId::parse("huawei").unwrap();
        let nested = ObjectRef::parse("apps/x/y/game.apk").unwrap();
        let joined = ObjectRef::parse("apps/x_y/game.apk").unwrap();
        assert_eq!(nested.flattened(), joined.flattened());
        assert_ne!(
            ScratchPaths::new(work_dir, &nested, &channel).dir,
            ScratchPaths::new(work_dir, &joined, &channel).dir
        );

        let split_bucket = ObjectRef::parse("a_b/game.apk").unwrap();
        let split_key = ObjectRef::parse("a/b_game.apk").unwrap();
        assert_eq!(split_bucket.flattened(), split_key.flattened());
        let a = ScratchPaths::new(work_dir, &split_bucket, &channel);
        let b = ScratchPaths::new(work_dir, &split_key, &channel);
        assert_ne!(a.dir, b.dir);
    }

    #[test]
    fn unusual_channels_stay_inside_the_work_dir() {
        let work_dir = Path::new("/mnt/auto");
        let source = ObjectRef::parse("apps/game.apk").unwrap();
        for channel in ["../up", "华为", "a/b", "c".repeat(128).as_str()] {
            let paths = ScratchPaths::new(work_dir, &source, &ChannelId::parse(channel).unwrap());
            assert_eq!(paths.dir.parent(), Some(work_dir));
            let name = paths.dir.file_name().unwrap().to_str().unwrap();
            assert!(name.len() < 255);
            assert!(!name.contains('/'));
        }
    }

    #[test]
    fn footer_without_meta_is_not_a_cached_result() {
        let dir = tempfile::tempdir().unwrap();
        let source = ObjectRef::parse("apps/game.apk").unwrap();
        let channel = ChannelId::parse("oppo").unwrap();
        let paths = ScratchPaths::new(dir.path(), &source, &channel);
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(&paths.footer, b"partial").unwrap();
        assert!(paths.load().unwrap().is_none());

        let result = RepackResult {
            split_offset: 10,
            footer_size: 3
        };
        paths.store(&result, b"end").unwrap();
        assert_eq!(paths.load().unwrap().unwrap().result, result);
    }

    #[test]
    fn corrupt_meta_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ObjectRef::parse("apps/game.apk").unwrap();
        let channel = ChannelId::parse("oppo").unwrap();
        let paths = ScratchPaths::new(dir.path(), &source, &channel);
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(&paths.footer, b"end").unwrap();
        std::fs::write(&paths.meta, b"{not json").unwrap();
        assert_eq!(paths.load().unwrap_err().kind(), ErrorKind::Io);
    }
}
