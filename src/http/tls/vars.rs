//! Negotiated TLS parameters
//!
//! Populated once after the handshake; the connection handler uses the ALPN
//! field to refuse anything that did not negotiate `h2`.

use openssl::ssl::SslRef;

/// TLS variables available after handshake
#[derive(Debug, Clone, Default)]
pub struct TlsVars {
    /// Negotiated TLS version (e.g., "TLSv1.3")
    pub version: String,

    /// Negotiated cipher suite
    pub cipher: String,

    /// SNI servername sent by the client
    pub servername: Option<String>,

    /// Negotiated ALPN protocol
    pub alpn: Option<String>,
}

impl TlsVars {
    /// Create TLS variables from an SSL connection
    pub fn from_ssl(ssl: &SslRef) -> Self {
        TlsVars {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<undef>".to_string()),
            servername: ssl
                .servername(openssl::ssl::NameType::HOST_NAME)
                .map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).to_string()),
        }
    }

    /// Whether the connection negotiated HTTP/2
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some("h2")
    }
}
