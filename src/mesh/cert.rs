/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/mesh/cert.rs
 *
 * CA fingerprinting and gateway TLS self-minting. Fingerprinting is a pure
 * SHA-256/hex computation over the raw `root-cert.pem` bytes. Minting
 * produces the self-signed gateway certificate seeded on first run on the
 * storage cluster when no `EASTWEST_CERT_B64`/`_KEY_B64` pair exists yet.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

const RSA_KEY_BITS: usize = 2048;

/// Hex-encoded SHA-256 of `pem_bytes`, used as the cross-cluster CA equality
/// token (spec.md §3/§8's fingerprint seed: SHA-256 of `"hello\n"`, hex).
pub fn fingerprint(pem_bytes: &[u8]) -> String {
    let digest = Sha256::digest(pem_bytes);
    hex::encode(digest)
}

pub struct GatewayCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Mints a self-signed gateway certificate valid for one year, CN `cn`, with
/// DNS SANs covering the control-plane short and FQDN names.
///
/// rcgen (ring-backed) cannot generate RSA key material itself, only import
/// it for signing, so the RSA-2048 key spec.md §3 names is generated with
/// `rsa` and imported into rcgen as a PKCS8 key pair.
pub fn mint_gateway_cert(cn: &str, control_plane_service: &str, mesh_namespace: &str) -> Result<GatewayCert> {
    let sans = vec![
        cn.to_string(),
        format!("{}.{}.svc", control_plane_service, mesh_namespace),
        format!("{}.{}.svc.cluster.local", control_plane_service, mesh_namespace),
    ];

    let mut params = CertificateParams::new(sans)
        .map_err(|e| Error::Other(anyhow::anyhow!("invalid gateway cert SAN list: {}", e)))?;
    params.distinguished_name.push(DnType::CommonName, cn);
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(365);

    let key_pair = generate_rsa_key_pair()?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to self-sign gateway cert: {}", e)))?;

    Ok(GatewayCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Generates an RSA-2048 key pair and imports it into rcgen for
/// PKCS#1v1.5/SHA-256 signing.
fn generate_rsa_key_pair() -> Result<KeyPair> {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to generate RSA-{} key: {}", RSA_KEY_BITS, e)))?;
    let pkcs8_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to encode RSA key as PKCS8: {}", e)))?;
    KeyPair::from_pkcs8_pem_and_sign_algo(&pkcs8_pem, &PKCS_RSA_SHA256)
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to import RSA key pair into rcgen: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_known_sha256_of_hello() {
        let fp = fingerprint(b"hello\n");
        assert_eq!(
            fp,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn mint_gateway_cert_includes_requested_sans() {
        let cert = mint_gateway_cert("istiod.istio-system.svc", "istiod", "istio-system").unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("BEGIN"));
    }
}
