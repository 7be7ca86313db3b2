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
    io::Write,
    path::PathBuf,
    process::Command
};

use rasn::types::{Any, Integer::Primitive, Oid};
use rasn_cms::{
    algorithms::RSA, pkcs7_compat::SignedData, Certificate, CertificateChoices, ContentInfo,
    IssuerAndSerialNumber, SignerIdentifier, SignerInfo
};
use repack_common::*;
use rsa::Pkcs1v15Sign;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::crypto_keys::Keys;

const OID_SHA1: &Oid = Oid::const_new(&[1, 3, 14, 3, 2, 26]);
const OID_PKCS7_DATA: &Oid = Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_DATA;
const OID_PKCS7_SIGNED_DATA: &Oid = Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_SIGNED_DATA;
// DER NULL, the parameters openssl writes for SHA-1 and rsaEncryption
const DER_NULL: [u8; 2] = [0x05, 0x00];

/// Produces the signature block (`.RSA`) for a signature file.
///
/// Output is a DER encoded PKCS#7 SignedData with detached content, SHA-1
/// and RSA PKCS#1 v1.5, no signed attributes and the signer's certificate
/// embedded.
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

fn algorithm(oid: &Oid) -> rasn_cms::AlgorithmIdentifier {
    rasn_cms::AlgorithmIdentifier {
        algorithm: oid.into(),
        parameters: Some(Any::new(DER_NULL.to_vec()))
    }
}

/// Signs in-process with `rsa` and encodes with `rasn-cms`.
pub struct Pkcs7Signer {
    keys: Keys,
    certificate: Certificate
}

impl Pkcs7Signer {
    pub fn new(keys: Keys) -> Result<Self> {
        let certificate = rasn::der::decode::<Certificate>(&keys.certificate)?;
        Ok(Pkcs7Signer { keys, certificate })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }
}

impl Signer for Pkcs7Signer {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha1::digest(data);
        let padding = Pkcs1v15Sign::new::<Sha1>();
        let signature = self.keys.private_key.sign(padding, &digest)?;

        let tbs = &self.certificate.tbs_certificate;
        let signer_info = SignerInfo {
            version: Primitive(1),
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: tbs.issuer.clone(),
                serial_number: tbs.serial_number.clone()
            }),
            digest_algorithm: algorithm(OID_SHA1),
            signed_attrs: None,
            signature_algorithm: algorithm(RSA),
            signature: signature.into(),
            unsigned_attrs: None
        };

        let signed_data = SignedData {
            version: Primitive(1),
            digest_algorithms: vec![algorithm(OID_SHA1)].into(),
            encap_content_info: rasn_cms::pkcs7_compat::EncapsulatedContentInfo {
                content_type: OID_PKCS7_DATA.into(),
                content: None
            },
            certificates: Some(
                vec![CertificateChoices::Certificate(Box::new(self.certificate.clone()))].into()
            ),
            crls: None,
            signer_infos: vec![signer_info].into()
        };

        let wrapper = ContentInfo {
            content_type: OID_PKCS7_SIGNED_DATA.into(),
            content: Any::new(rasn::der::encode(&signed_data)?)
        };
        Ok(rasn::der::encode(&wrapper)?)
    }
}

/// Shells out to `openssl smime`.
pub struct OpensslSigner {
    pub program: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf
}

impl OpensslSigner {
    pub fn new(certificate: PathBuf, private_key: PathBuf) -> Self {
        OpensslSigner {
            program: "openssl".into(),
            certificate,
            private_key
        }
    }
}

impl Signer for OpensslSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut input = NamedTempFile::new()?;
        input.write_all(data)?;
        input.flush()?;

        debug!(program = %self.program.display(), "running signing command");
        let output = Command::new(&self.program)
            .args(["smime", "-sign", "-binary", "-noattr", "-md", "sha1", "-outform", "DER"])
            .arg("-in")
            .arg(input.path())
            .arg("-signer")
            .arg(&self.certificate)
            .arg("-inkey")
            .arg(&self.private_key)
            .output()
            .map_err(|e| {
                RepackError::SignerCommandFailed(format!("{}: {e}", self.program.display()))
            })?;

        if !output.status.success() {
            return Err(RepackError::SignerCommandFailed(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(RepackError::SignerCommandFailed("empty signature".into()));
        }
        Ok(output.stdout)
    }
}
