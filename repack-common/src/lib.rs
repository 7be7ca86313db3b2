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

use std::{io, sync::Arc};

use deku::prelude::*;
use rsa::{pkcs1, pkcs8};
use zip::result::ZipError;

mod object;
mod scratch;

pub use object::{ChannelId, ObjectRef};
pub use scratch::write_atomic;

/// Common error type making it easier to share `Result`s between repack crates.
///
/// In general designed to avoid needing utilities like `map_err`. Foreign
/// errors are held behind an [Arc] so the type stays `Clone + Send + Sync` and
/// can cross the blocking pool and the multipart worker threads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepackError {
    /// The `src` parameter was not of the form `bucket/key`.
    #[error("src = {0} is invalid, the format is bucket/objectkey")]
    InvalidSource(String),
    /// The channel id is empty, longer than 128 bytes or contains control
    /// characters.
    #[error("invalid channel id: {0:?}")]
    InvalidChannel(String),
    /// The `Range` header was missing, malformed, empty or too large, or it
    /// starts beyond the end of the repacked package.
    #[error("invalid range: {0}")]
    InvalidRange(String),
    /// The archive has no `META-INF/MANIFEST.MF` entry.
    #[error("manifest file not found")]
    ManifestNotFound,
    /// A manifest record could not be split into its `Name:` and digest
    /// lines, or the manifest is not valid UTF-8.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
    /// The remote object could not be read as a ZIP container: no End Of
    /// Central Directory record, or a central directory that doesn't line up.
    #[error("archive parsing failed: {0}")]
    ArchiveParsingFailed(String),
    /// The archive (or the archive we would produce) needs ZIP64 records.
    #[error("zip64 archives are not supported: {0}")]
    Zip64Unsupported(String),
    /// The `zip` crate failed while reading an entry or writing new ones.
    #[error("zip: {0}")]
    ZipFailed(Arc<ZipError>),
    /// Serialising or parsing a fixed-layout ZIP record failed. See
    /// [DekuError].
    #[error("byte serialisation failed: {0}")]
    ByteSerialisationFailed(DekuError),
    /// An object store call failed. `operation` names the store primitive,
    /// `object` is the `bucket/key` it was issued against.
    #[error("{operation} {object}: {message}")]
    Store {
        operation: &'static str,
        object: String,
        message: String
    },
    /// The store has no such object.
    #[error("{operation} {object}: no such key")]
    ObjectNotFound {
        operation: &'static str,
        object: String
    },
    /// The store refused the request with a client error that repeating it
    /// won't fix.
    #[error("{operation} {object}: rejected with status {status}: {message}")]
    StoreRejected {
        operation: &'static str,
        object: String,
        status: u16,
        message: String
    },
    /// The store returned fewer bytes than requested, or a read was asked
    /// to go past the end of the object.
    #[error("short read from {object} at {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        object: String,
        offset: u64,
        expected: u64,
        actual: u64
    },
    /// The external signing command exited unsuccessfully or produced no
    /// output.
    #[error("signing command failed: {0}")]
    SignerCommandFailed(String),
    /// An error occurred while trying to instantiate a `Keys` object from a
    /// `.pem` string.
    #[error("pem parsing failed: {0}")]
    SignerPemParsingFailed(Arc<pem::PemError>),
    /// The `.pem` input was valid, but it was missing either a certificate or
    /// private key.
    #[error("pem input has no certificate or no private key")]
    SignerNoKeys,
    /// The `PRIVATE KEY` in the `.pem` was present, but it wasn't an RSA
    /// Private Key.
    #[error("private key is not a PKCS#8 RSA key: {0}")]
    SignerRsaPrivateKeyParsingFailed(pkcs8::Error),
    /// The `RSA PRIVATE KEY` in the `.pem` couldn't be parsed as PKCS#1.
    #[error("private key is not a PKCS#1 RSA key: {0}")]
    SignerRsaPkcs1KeyParsingFailed(pkcs1::Error),
    /// An error occurred while signing a hash, see [rsa::Error].
    #[error("rsa signing failed: {0}")]
    SignerRsaSigningFailed(Arc<rsa::Error>),
    /// Random testing keys could not be turned into a certificate.
    #[error("certificate generation failed: {0}")]
    SignerCertificateGenerationFailed(String),
    /// The signing certificate couldn't be decoded from DER.
    #[error("certificate decoding failed: {0}")]
    SignerCertificateDecodingFailed(Arc<rasn::error::DecodeError>),
    /// The PKCS#7 signature block couldn't be serialised.
    #[error("pkcs7 encoding failed: {0}")]
    SignerPKCS7EncodingFailed(Arc<rasn::error::EncodeError>),
    /// The `<key>.meta` file in the scratch directory isn't valid JSON.
    #[error("scratch metadata: {0}")]
    ScratchMetadataFailed(Arc<serde_json::Error>),
    /// Local disk I/O failed: scratch directory, footer file or the sink of
    /// an append writer.
    #[error("i/o: {0}")]
    FileIoError(Arc<io::Error>)
}

/// Coarse classification of [RepackError], used to decide retries and to
/// report failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request parameters. Never retried.
    Input,
    /// The archive or its manifest can't be processed.
    Format,
    /// The object store failed. Reads may be retried.
    Store,
    /// Key material or the signing step failed.
    Signing,
    /// Local disk failures.
    Io
}

impl RepackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepackError::InvalidSource(_)
            | RepackError::InvalidChannel(_)
            | RepackError::InvalidRange(_) => ErrorKind::Input,
            RepackError::ManifestNotFound
            | RepackError::MalformedManifest(_)
            | RepackError::ArchiveParsingFailed(_)
            | RepackError::Zip64Unsupported(_)
            | RepackError::ZipFailed(_)
            | RepackError::ByteSerialisationFailed(_) => ErrorKind::Format,
            RepackError::Store { .. }
            | RepackError::ObjectNotFound { .. }
            | RepackError::StoreRejected { .. }
            | RepackError::ShortRead { .. } => ErrorKind::Store,
            RepackError::SignerCommandFailed(_)
            | RepackError::SignerPemParsingFailed(_)
            | RepackError::SignerNoKeys
            | RepackError::SignerRsaPrivateKeyParsingFailed(_)
            | RepackError::SignerRsaPkcs1KeyParsingFailed(_)
            | RepackError::SignerRsaSigningFailed(_)
            | RepackError::SignerCertificateGenerationFailed(_)
            | RepackError::SignerCertificateDecodingFailed(_)
            | RepackError::SignerPKCS7EncodingFailed(_) => ErrorKind::Signing,
            RepackError::ScratchMetadataFailed(_) | RepackError::FileIoError(_) => ErrorKind::Io
        }
    }

    /// Whether repeating the failed call may succeed. Only store failures
    /// that aren't a definite answer from the store qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepackError::Store { .. })
    }

    pub fn not_found(operation: &'static str, object: &ObjectRef) -> Self {
        RepackError::ObjectNotFound {
            operation,
            object: object.to_string()
        }
    }

    /// Builds a [RepackError::Store] for a failed store primitive.
    pub fn store(operation: &'static str, object: &ObjectRef, message: impl ToString) -> Self {
        RepackError::Store {
            operation,
            object: object.to_string(),
            message: message.to_string()
        }
    }
}

/// Result type where the error is always [RepackError].
pub type Result<T> = std::result::Result<T, RepackError>;

// Automatic conversion from other types of error to RepackError makes the rest of the code cleaner
impl From<io::Error> for RepackError {
    fn from(value: io::Error) -> Self {
        // Errors tunnelled through `Read`/`Seek` impls come back out unchanged
        if let Some(inner) = value.get_ref().and_then(|e| e.downcast_ref::<RepackError>()) {
            return inner.clone();
        }
        RepackError::FileIoError(value.into())
    }
}

impl From<DekuError> for RepackError {
    fn from(value: DekuError) -> Self {
        RepackError::ByteSerialisationFailed(value)
    }
}

impl From<ZipError> for RepackError {
    fn from(value: ZipError) -> Self {
        match value {
            ZipError::Io(e) => e.into(),
            other => RepackError::ZipFailed(other.into())
        }
    }
}

impl From<pem::PemError> for RepackError {
    fn from(value: pem::PemError) -> Self {
        RepackError::SignerPemParsingFailed(value.into())
    }
}

impl From<pkcs8::Error> for RepackError {
    fn from(value: pkcs8::Error) -> Self {
        RepackError::SignerRsaPrivateKeyParsingFailed(value)
    }
}

impl From<pkcs1::Error> for RepackError {
    fn from(value: pkcs1::Error) -> Self {
        RepackError::SignerRsaPkcs1KeyParsingFailed(value)
    }
}

impl From<rsa::Error> for RepackError {
    fn from(value: rsa::Error) -> Self {
        RepackError::SignerRsaSigningFailed(value.into())
    }
}

impl From<rasn::error::DecodeError> for RepackError {
    fn from(value: rasn::error::DecodeError) -> Self {
        RepackError::SignerCertificateDecodingFailed(value.into())
    }
}

impl From<rasn::error::EncodeError> for RepackError {
    fn from(value: rasn::error::EncodeError) -> Self {
        RepackError::SignerPKCS7EncodingFailed(value.into())
    }
}

impl From<serde_json::Error> for RepackError {
    fn from(value: serde_json::Error) -> Self {
        RepackError::ScratchMetadataFailed(value.into())
    }
}

// `ZipArchive` and `std::io::Read` impls need to hand our errors back through io::Error
impl From<RepackError> for io::Error {
    fn from(value: RepackError) -> Self {
        match value {
            RepackError::FileIoError(inner) => io::Error::new(inner.kind(), inner.to_string()),
            other => io::Error::other(other)
        }
    }
}
