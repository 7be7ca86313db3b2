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

//! Signature Scheme v1, aka. Signed JAR File format: patches the manifest
//! with the channel marker and regenerates `.SF` and `.RSA` for it.

pub mod crypto_keys;
pub mod manifest;
mod resigner;
pub mod signature_file;
mod signer;

pub use resigner::{
    signature_basename, JarResigner, SigningArtifacts, CHANNEL_MARKER_PATH,
    DEFAULT_SIGNATURE_BASENAME, MANIFEST_PATH, META_INF
};
pub use signer::{OpensslSigner, Pkcs7Signer, Signer};
