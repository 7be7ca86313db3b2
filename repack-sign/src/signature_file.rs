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

use base64::{prelude::BASE64_STANDARD, Engine};
use sha1::{Digest, Sha1};

use crate::manifest::{fold_line, Manifest};

pub fn b64_digest(input: impl AsRef<[u8]>) -> String {
    let digest = Sha1::digest(input);
    BASE64_STANDARD.encode(digest)
}

/// The `SHA1-Digest: ...` attribute line for `input`, without CRLF.
pub fn digest_line(input: impl AsRef<[u8]>) -> Vec<u8> {
    format!("SHA1-Digest: {}", b64_digest(input)).into_bytes()
}

/// Creates the `.SF` file for `manifest`: a digest of the whole manifest,
/// then one section per manifest entry holding the digest of that entry's
/// record.
pub fn create_signature_file(manifest: &Manifest) -> Vec<u8> {
    let manifest_bytes = manifest.to_bytes();
    let mut output = b"Signature-Version: 1.0\r\n".to_vec();
    output.extend(format!("SHA1-Digest-Manifest: {}\r\n\r\n", b64_digest(&manifest_bytes)).into_bytes());

    for entry in manifest.entries() {
        let mut name_line = b"Name: ".to_vec();
        name_line.extend(entry.name());
        output.extend(fold_line(&name_line));
        output.extend(fold_line(&digest_line(entry.section_bytes())));
        output.extend_from_slice(b"\r\n");
    }
    output
}
