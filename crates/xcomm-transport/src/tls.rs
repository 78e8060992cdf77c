use std::sync::Arc;

use rustls::RootCertStore;
use webpki_types::pem::PemObject;
use webpki_types::{CertificateDer, ServerName};

use crate::endpoint::TlsOptions;
use crate::CommError;

/// rustls client config: web PKI roots plus the endpoint's extra CA bundle.
pub(crate) fn client_config(tls: &TlsOptions) -> Result<Arc<rustls::ClientConfig>, CommError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &tls.ca_cert_path {
        let certs = CertificateDer::pem_file_iter(path)
            .map_err(|e| CommError::Tls(format!("reading {}: {e}", path.display())))?;
        for cert in certs {
            let cert = cert.map_err(|e| CommError::Tls(format!("parsing {}: {e}", path.display())))?;
            roots
                .add(cert)
                .map_err(|e| CommError::Tls(format!("trust anchor {}: {e}", path.display())))?;
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CommError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Name to verify: the override if set, else the host.
pub(crate) fn server_name(tls: &TlsOptions, host: &str) -> Result<ServerName<'static>, CommError> {
    let name = tls.server_name.clone().unwrap_or_else(|| host.to_string());
    ServerName::try_from(name.clone())
        .map_err(|e| CommError::Tls(format!("invalid server name {name}: {e}")))
}

/// Raw PEM bytes of the extra CA bundle, for clients that take PEM directly.
pub(crate) fn ca_pem(tls: &TlsOptions) -> Result<Option<Vec<u8>>, CommError> {
    match &tls.ca_cert_path {
        Some(path) => std::fs::read(path)
            .map(Some)
            .map_err(|e| CommError::Tls(format!("reading {}: {e}", path.display()))),
        None => Ok(None),
    }
}
