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

use std::{collections::HashMap, path::Path};

use repack_common::*;
use rsa::{pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, RsaPrivateKey, RsaPublicKey};

/// Holds the certificate and RSA Private Key used for signing.
pub struct Keys {
    /// X.509 Signing Certificate in ASN.1 DER form
    pub certificate: Vec<u8>,
    /// RSA Public Key
    pub public_key: RsaPublicKey,
    /// RSA Private Key
    pub private_key: RsaPrivateKey
}

impl Keys {
    /// Parses and creates an instance of [Keys] from a `.pem` string.
    ///
    /// "Combined" in this case means that the one string has both a `BEGIN
    /// CERTIFICATE` section and a private key section. The key may be PKCS#8
    /// (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    pub fn from_combined_pem_string(combined_pem: &str) -> Result<Keys> {
        let pem_map = parse_pem_map_by_tags(combined_pem)?;
        let certificate = pem_map
            .get("CERTIFICATE")
            .ok_or(RepackError::SignerNoKeys)?
            .clone();

        let private_key = if let Some(der) = pem_map.get("PRIVATE KEY") {
            RsaPrivateKey::from_pkcs8_der(der)?
        } else if let Some(der) = pem_map.get("RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_der(der)?
        } else {
            return Err(RepackError::SignerNoKeys);
        };
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Keys {
            public_key,
            private_key,
            certificate
        })
    }

    /// Loads the certificate and private key from two `.pem` files, the
    /// layout `openssl req -x509 -keyout key.pem -out cert.pem` produces.
    pub fn from_pem_files(certificate: &Path, private_key: &Path) -> Result<Keys> {
        let mut combined = std::fs::read_to_string(certificate)?;
        combined.push('\n');
        combined.push_str(&std::fs::read_to_string(private_key)?);
        Self::from_combined_pem_string(&combined)
    }

    /// Randomly generates RSA signing keys and an accompanying self-signed
    /// certificate.
    ///
    /// Only enabled with the optional "cert-gen" feature (on by default). It
    /// is slow and packages signed this way can't be updated in place by
    /// packages signed with the real key, so it's only meant for trying the
    /// service out and for tests.
    #[cfg(feature = "cert-gen")]
    pub fn generate_random_testing_keys() -> Result<Keys> {
        // These dependencies only exist when compiled with cert-gen
        use rand::prelude::*;
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};

        tracing::warn!("randomly generating a placeholder signing key, provide real keys for production");

        let private_key = RsaPrivateKey::new(&mut thread_rng(), 2048)?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();

        // Self-sign an X.509 certificate using the random keys
        let cert_err = |e: rcgen::Error| RepackError::SignerCertificateGenerationFailed(e.to_string());
        let key_pair = KeyPair::from_pem(&private_key_pem).map_err(cert_err)?;
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, env!("CARGO_PKG_NAME"));
        let mut cert_params = CertificateParams::new(vec![]).map_err(cert_err)?;
        cert_params.distinguished_name = distinguished_name;
        let cert = cert_params.self_signed(&key_pair).map_err(cert_err)?;

        Ok(Self {
            certificate: cert.der().to_vec(),
            private_key,
            public_key
        })
    }
}

/// Parses a .pem file and returns a map of Tag -> Contents
fn parse_pem_map_by_tags(combined_pem: &str) -> Result<HashMap<String, Vec<u8>>> {
    let parsed = pem::parse_many(combined_pem)?;
    let mut map = HashMap::new();
    for pem_part in parsed {
        map.insert(pem_part.tag().into(), pem_part.into_contents());
    }
    Ok(map)
}
