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
    io::{Read, Seek},
    path::Path,
    sync::Arc
};

use repack_common::*;
use repack_zip::ArchiveSplicer;
use tracing::{debug, info};

use crate::{
    manifest::Manifest,
    signature_file::{create_signature_file, digest_line},
    signer::Signer
};

pub const META_INF: &str = "META-INF/";
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
/// Entry whose content is the channel id.
pub const CHANNEL_MARKER_PATH: &str = "assets/dap.properties";
pub const DEFAULT_SIGNATURE_BASENAME: &str = "CERT";

/// Basename of the first `META-INF/<name>.SF` entry, or `CERT`.
pub fn signature_basename<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .filter_map(|name| name.strip_prefix(META_INF)?.strip_suffix(".SF"))
        .find(|base| !base.is_empty() && !base.contains('/'))
        .unwrap_or(DEFAULT_SIGNATURE_BASENAME)
        .to_string()
}

/// The regenerated v1 signature of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningArtifacts {
    pub basename: String,
    pub manifest: Vec<u8>,
    pub signature_file: Vec<u8>,
    pub signature_block: Vec<u8>
}

impl SigningArtifacts {
    pub fn signature_file_path(&self) -> String {
        format!("{META_INF}{}.SF", self.basename)
    }

    pub fn signature_block_path(&self) -> String {
        format!("{META_INF}{}.RSA", self.basename)
    }

    /// `(archive path, content)` of the three entries, manifest first.
    pub fn entries(&self) -> [(String, &[u8]); 3] {
        [
            (MANIFEST_PATH.to_string(), self.manifest.as_slice()),
            (self.signature_file_path(), self.signature_file.as_slice()),
            (self.signature_block_path(), self.signature_block.as_slice())
        ]
    }

    /// Writes `MANIFEST.MF`, `<base>.SF` and `<base>.RSA` into `dir`.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        write_atomic(&dir.join("MANIFEST.MF"), &self.manifest)?;
        write_atomic(&dir.join(format!("{}.SF", self.basename)), &self.signature_file)?;
        write_atomic(&dir.join(format!("{}.RSA", self.basename)), &self.signature_block)?;
        Ok(())
    }
}

/// Re-signs a package after the channel marker changed.
///
/// The steps are strictly ordered, each one digests the previous output:
/// manifest, then signature file, then signature block.
pub struct JarResigner {
    signer: Arc<dyn Signer>
}

impl JarResigner {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        JarResigner { signer }
    }

    pub fn resign<R: Read + Seek>(
        &self,
        archive: &mut ArchiveSplicer<R>,
        channel: &ChannelId
    ) -> Result<SigningArtifacts> {
        let manifest = archive
            .read_entry(MANIFEST_PATH)?
            .ok_or(RepackError::ManifestNotFound)?;
        let basename = signature_basename(archive.entry_names());
        debug!(%basename, manifest_len = manifest.len(), "read manifest");
        self.resign_manifest(&manifest, basename, channel)
    }

    /// Same as [JarResigner::resign] with the manifest and basename already
    /// extracted.
    pub fn resign_manifest(
        &self,
        manifest: &[u8],
        basename: String,
        channel: &ChannelId
    ) -> Result<SigningArtifacts> {
        let mut manifest = Manifest::parse(manifest)?;
        let existed = manifest
            .entries()
            .any(|e| e.name() == CHANNEL_MARKER_PATH.as_bytes());
        manifest.set_entry_digest(CHANNEL_MARKER_PATH.as_bytes(), &digest_line(channel.as_bytes()));
        info!(%channel, replaced = existed, "patched manifest");

        let signature_file = create_signature_file(&manifest);
        let signature_block = self.signer.sign(&signature_file)?;

        Ok(SigningArtifacts {
            basename,
            manifest: manifest.to_bytes(),
            signature_file,
            signature_block
        })
    }
}
