//! TLS configuration
//!
//! This module provides TLS configuration builders for both client and server.
//! The server side is what the harness listens with; the client side exists
//! so frame-level probes can talk to the server without a full HTTP client.

use super::cert::Credentials;
use openssl::ssl::{AlpnError, SslContextBuilder, SslMethod, SslVerifyMode};

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("ALPN negotiation failed: expected h2, got {0:?}")]
    AlpnFailed(Option<String>),
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: openssl::ssl::SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    /// Create a new server configuration builder
    pub fn server() -> Result<ServerConfigBuilder, TlsError> {
        ServerConfigBuilder::new()
    }

    /// Whether this is a server-side configuration
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Connect to a server with TLS (client-side)
    pub fn connect(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        super::session::TlsSessionOps::connect(stream, self.clone())
    }

    /// Accept a client connection with TLS (server-side)
    pub fn accept(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self.clone())
    }
}

/// Encode ALPN protocols in wire format (length-prefixed)
fn encode_alpn(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    let mut alpn_bytes = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .map_err(|_| TlsError::InvalidConfig(format!("ALPN protocol too long: {}", proto)))?;
        alpn_bytes.push(len);
        alpn_bytes.extend_from_slice(proto.as_bytes());
    }
    Ok(alpn_bytes)
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    servername: Option<String>,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;

        // Default: don't verify peer (loopback certificates are self-signed)
        ctx_builder.set_verify(SslVerifyMode::NONE);

        Ok(ClientConfigBuilder {
            ctx_builder,
            servername: None,
        })
    }

    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Result<Self, TlsError> {
        self.ctx_builder.set_min_proto_version(Some(version.to_openssl_version()))?;
        self.ctx_builder.set_max_proto_version(Some(version.to_openssl_version()))?;
        Ok(self)
    }

    /// Set ALPN protocols
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        let alpn_bytes = encode_alpn(protocols)?;
        self.ctx_builder.set_alpn_protos(&alpn_bytes)?;
        Ok(self)
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        if verify {
            self.ctx_builder.set_verify(SslVerifyMode::PEER);
        } else {
            self.ctx_builder.set_verify(SslVerifyMode::NONE);
        }
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: false,
            servername: self.servername,
        })
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    ctx_builder: SslContextBuilder,
    has_cert: bool,
}

impl ServerConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let ctx_builder = SslContextBuilder::new(SslMethod::tls_server())?;

        Ok(ServerConfigBuilder {
            ctx_builder,
            has_cert: false,
        })
    }

    /// Set TLS version range
    ///
    /// HTTP/2 over TLS needs at least TLS 1.2.
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        self.ctx_builder.set_min_proto_version(Some(min.to_openssl_version()))?;
        self.ctx_builder.set_max_proto_version(Some(max.to_openssl_version()))?;
        Ok(self)
    }

    /// Set ALPN protocols
    ///
    /// Clients that offer none of `protocols` fail the handshake with a
    /// fatal `no_application_protocol` alert.
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        let protocols_vec: Vec<Vec<u8>> = protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        // Set the ALPN selection callback (server-side protocol negotiation)
        self.ctx_builder.set_alpn_select_callback(move |_ssl, client_protos| {
            // Parse client protocols (length-prefixed format)
            let mut pos = 0;
            while pos < client_protos.len() {
                let len = client_protos[pos] as usize;
                pos += 1;
                if pos + len > client_protos.len() {
                    break;
                }
                let client_proto = &client_protos[pos..pos + len];

                if protocols_vec.iter().any(|proto| client_proto == proto.as_slice()) {
                    // Return the matching protocol from client_protos (valid lifetime)
                    return Ok(client_proto);
                }

                pos += len;
            }

            Err(AlpnError::ALERT_FATAL)
        });

        Ok(self)
    }

    /// Install a certificate and private key
    pub fn credentials(mut self, credentials: &Credentials) -> Result<Self, TlsError> {
        self.ctx_builder.set_certificate(credentials.certificate())?;
        self.ctx_builder.set_private_key(credentials.private_key())?;
        self.ctx_builder.check_private_key()?;
        self.has_cert = true;
        Ok(self)
    }

    /// Build the TLS configuration
    ///
    /// Without explicit credentials an ephemeral loopback certificate is issued.
    pub fn build(mut self) -> Result<TlsConfig, TlsError> {
        if !self.has_cert {
            let credentials = Credentials::ephemeral_loopback()?;
            self = self.credentials(&credentials)?;
        }

        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: true,
            servername: None,
        })
    }
}
