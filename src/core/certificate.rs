//! TLS certificates loaded from cluster secrets.

use std::{collections::HashSet, io::BufReader, sync::Arc};

use rustls::{crypto::aws_lc_rs::sign::any_supported_type, sign::CertifiedKey};
use thiserror::Error;

use crate::ports::cluster::{ObjectRef, SecretData};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CertificateError {
    #[error("No certificate found in PEM data")]
    NoCertificates,

    #[error("No private key found in PEM data")]
    NoPrivateKey,

    #[error("Failed to parse PEM data: {0}")]
    Pem(#[from] std::io::Error),

    #[error("Unsupported private key: {0}")]
    UnsupportedKey(#[from] rustls::Error),
}

/// A certificate/key pair and the hostnames it may serve.
///
/// A certificate whose material is missing or unparseable is still kept (so
/// the route stays secure and redirects to HTTPS) but is never valid for any
/// host, so an SNI lookup for it fails closed.
#[derive(Debug)]
pub struct TlsCertificate {
    source: ObjectRef,
    certified_key: Option<Arc<CertifiedKey>>,
    hostnames: Option<HashSet<String>>,
}

impl TlsCertificate {
    pub fn from_secret(secret: &SecretData) -> Self {
        let certified_key = match (&secret.cert_pem, &secret.key_pem) {
            (Some(cert), Some(key)) => match load_certified_key(cert, key) {
                Ok(certified_key) => Some(Arc::new(certified_key)),
                Err(e) => {
                    tracing::warn!(secret = %secret.object, "Unusable certificate in secret: {}", e);
                    None
                }
            },
            _ => {
                tracing::debug!(secret = %secret.object, "Secret has no tls.crt/tls.key pair");
                None
            }
        };

        let hostnames = secret.valid_hostnames.as_ref().map(|names| {
            names
                .iter()
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect()
        });

        Self {
            source: secret.object.clone(),
            certified_key,
            hostnames,
        }
    }

    /// The secret this certificate was read from
    pub fn source(&self) -> &ObjectRef {
        &self.source
    }

    pub fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.certified_key.clone()
    }

    /// Whether the certificate material parsed into a usable signing key.
    pub fn is_usable(&self) -> bool {
        self.certified_key.is_some()
    }

    pub fn is_valid_for_host(&self, host: &str) -> bool {
        if self.certified_key.is_none() {
            return false;
        }
        match &self.hostnames {
            None => true,
            Some(hostnames) => hostnames.contains(&host.to_ascii_lowercase()),
        }
    }
}

fn load_certified_key(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, CertificateError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(CertificateError::NoCertificates);
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))?
        .ok_or(CertificateError::NoPrivateKey)?;
    let signing_key = any_supported_type(&key)?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(hostnames: Option<Vec<&str>>) -> SecretData {
        let generated = rcgen::generate_simple_self_signed(vec!["a.example.com".to_string()]).unwrap();
        SecretData {
            object: ObjectRef::new("default", "tls"),
            cert_pem: Some(generated.cert.pem().into_bytes()),
            key_pem: Some(generated.signing_key.serialize_pem().into_bytes()),
            valid_hostnames: hostnames.map(|h| h.into_iter().map(String::from).collect()),
        }
    }

    #[test]
    fn test_any_host_without_hostnames() {
        let certificate = TlsCertificate::from_secret(&secret(None));
        assert!(certificate.is_usable());
        assert!(certificate.is_valid_for_host("a.example.com"));
        assert!(certificate.is_valid_for_host("anything.test"));
    }

    #[test]
    fn test_hostname_restriction() {
        let certificate =
            TlsCertificate::from_secret(&secret(Some(vec!["a.example.com", " B.example.com"])));
        assert!(certificate.is_valid_for_host("a.example.com"));
        assert!(certificate.is_valid_for_host("b.example.com"));
        assert!(certificate.is_valid_for_host("A.EXAMPLE.COM"));
        assert!(!certificate.is_valid_for_host("c.example.com"));
    }

    #[test]
    fn test_missing_material_is_never_valid() {
        let mut data = secret(None);
        data.key_pem = None;
        let certificate = TlsCertificate::from_secret(&data);
        assert!(!certificate.is_usable());
        assert!(!certificate.is_valid_for_host("a.example.com"));
    }

    #[test]
    fn test_garbage_material_is_never_valid() {
        let data = SecretData {
            object: ObjectRef::new("default", "broken"),
            cert_pem: Some(b"not a certificate".to_vec()),
            key_pem: Some(b"not a key".to_vec()),
            valid_hostnames: None,
        };
        let certificate = TlsCertificate::from_secret(&data);
        assert!(!certificate.is_valid_for_host("a.example.com"));
        assert_eq!(certificate.source(), &ObjectRef::new("default", "broken"));
    }
}
