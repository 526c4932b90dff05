//! Certificate issuing and inspection
//!
//! The harness never ships a certificate: every server instance gets a fresh
//! self-signed key pair for the loopback names. [`CertInfo`] extracts the
//! subject and SANs back out of an X.509 certificate for logging and tests.

use super::config::TlsError;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509, X509Ref};

/// Names every loopback certificate is issued for
pub const LOOPBACK_NAMES: &[&str] = &["localhost", "127.0.0.1"];

/// A private key with its self-signed certificate
pub struct Credentials {
    cert: X509,
    key: PKey<Private>,
    cert_pem: String,
}

impl Credentials {
    /// Issue an ephemeral self-signed certificate for `names`
    pub fn ephemeral(names: &[&str]) -> Result<Self, TlsError> {
        let subject_alt_names: Vec<String> = names.iter().map(|n| n.to_string()).collect();

        let issued = rcgen::generate_simple_self_signed(subject_alt_names)
            .map_err(|e| TlsError::Certificate(format!("Failed to generate certificate: {}", e)))?;
        let cert_pem = issued.cert.pem();
        let key_pem = issued.signing_key.serialize_pem();

        let cert = X509::from_pem(cert_pem.as_bytes())
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;

        Ok(Credentials { cert, key, cert_pem })
    }

    /// Issue an ephemeral certificate for [`LOOPBACK_NAMES`]
    pub fn ephemeral_loopback() -> Result<Self, TlsError> {
        Self::ephemeral(LOOPBACK_NAMES)
    }

    /// Certificate
    pub fn certificate(&self) -> &X509Ref {
        &self.cert
    }

    /// Private key
    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Certificate in PEM form (acts as its own CA)
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Subject and SAN summary of the certificate
    pub fn info(&self) -> CertInfo {
        CertInfo::from_x509_ref(&self.cert)
    }
}

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IP addresses)
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate reference
    pub fn from_x509_ref(cert: &X509Ref) -> Self {
        CertInfo {
            subject: Self::get_cn(cert.subject_name()),
            issuer: Self::get_cn(cert.issuer_name()),
            subject_alt_names: Self::get_subject_alt_names(cert),
        }
    }

    /// Get Common Name from X509_NAME
    fn get_cn(name: &openssl::x509::X509NameRef) -> String {
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<undef>".to_string())
    }

    /// Get Subject Alternative Names
    fn get_subject_alt_names(cert: &X509Ref) -> Vec<String> {
        let mut names = Vec::new();

        if let Some(san_ext) = cert.subject_alt_names() {
            for name in san_ext {
                if let Some(dns) = name.dnsname() {
                    names.push(format!("DNS:{}", dns));
                } else if let Some(ip) = name.ipaddress() {
                    match ip.len() {
                        4 => names.push(format!("IP:{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])),
                        16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(ip);
                            names.push(format!("IP:{}", std::net::Ipv6Addr::from(octets)));
                        }
                        _ => {}
                    }
                }
            }
        }

        names
    }
}
