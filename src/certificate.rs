use bytes::Bytes;
use rcgen::{CertificateParams, KeyPair};
use sha2::{Digest, Sha256};

use crate::configuration::CertificateType;
use crate::error::{Error, Result};
use crate::utils::{base64_decode, random_string};

/// Long-lived DTLS identity: key pair, self-signed X.509 certificate and
/// SHA-256 fingerprint.
///
/// The fingerprint is advertised in the local SDP and verified by the peer
/// against the certificate presented during the DTLS handshake.
#[derive(Clone)]
pub struct Certificate {
    certificate_der: Bytes,
    private_key_der: Bytes,
    certificate_pem: String,
    private_key_pem: String,
    fingerprint: String,
}

impl Certificate {
    /// Generates a self-signed certificate with a random common name.
    pub fn generate(certificate_type: CertificateType) -> Result<Self> {
        let key_pair = match certificate_type {
            CertificateType::Ecdsa => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256),
            CertificateType::Ed25519 => KeyPair::generate_for(&rcgen::PKCS_ED25519),
        }
        .map_err(|e| Error::Other(format!("key generation failed: {e}")))?;

        let params = CertificateParams::new(vec![random_string(16)])
            .map_err(|e| Error::Other(format!("certificate params: {e}")))?;
        let x509 = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Other(format!("certificate generation failed: {e}")))?;

        let certificate_der = Bytes::from(x509.der().to_vec());
        let fingerprint = make_fingerprint(&certificate_der);

        Ok(Self {
            certificate_der,
            private_key_der: Bytes::from(key_pair.serialize_der()),
            certificate_pem: x509.pem(),
            private_key_pem: key_pair.serialize_pem(),
            fingerprint,
        })
    }

    /// Loads an existing identity from PEM strings, keeping the fingerprint
    /// stable across sessions.
    pub fn from_pem(certificate_pem: &str, key_pem: &str) -> Result<Self> {
        let certificate_der = Bytes::from(pem_to_der(certificate_pem, "CERTIFICATE")?);
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| Error::ErrInvalidArgument(format!("key PEM: {e}")))?;
        let fingerprint = make_fingerprint(&certificate_der);

        Ok(Self {
            certificate_der,
            private_key_der: Bytes::from(key_pair.serialize_der()),
            certificate_pem: certificate_pem.to_string(),
            private_key_pem: key_pem.to_string(),
            fingerprint,
        })
    }

    /// SHA-256 fingerprint as lowercase colon-separated hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub(crate) fn certificate_der(&self) -> Bytes {
        self.certificate_der.clone()
    }

    pub(crate) fn private_key_der(&self) -> Bytes {
        self.private_key_der.clone()
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.certificate_der == other.certificate_der
    }
}

/// SHA-256 over the DER certificate, formatted the way SDP fingerprints
/// are: colon-separated hex byte pairs.
pub(crate) fn make_fingerprint(certificate_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(certificate_der);
    let hashed = hasher.finalize();
    let values: Vec<String> = hashed.iter().map(|x| format!("{x:02x}")).collect();
    values.join(":")
}

/// Compares two fingerprint strings, ignoring case.
pub(crate) fn fingerprint_matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn pem_to_der(pem: &str, tag: &str) -> Result<Vec<u8>> {
    let begin = format!("-----BEGIN {tag}-----");
    let end = format!("-----END {tag}-----");
    let start = pem
        .find(&begin)
        .ok_or_else(|| Error::ErrInvalidArgument(format!("missing {begin}")))?
        + begin.len();
    let stop = pem[start..]
        .find(&end)
        .ok_or_else(|| Error::ErrInvalidArgument(format!("missing {end}")))?
        + start;
    base64_decode(&pem[start..stop])
        .ok_or_else(|| Error::ErrInvalidArgument("invalid PEM body".to_string()))
}
