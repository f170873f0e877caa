use crate::config::TlsConfig;
use crate::errors::ServerError;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Builds a TLS acceptor from configured PEM material. ALPN offers `h2` on
/// HTTP/2 channels and `http/1.1` otherwise.
pub(crate) fn build_acceptor(config: &TlsConfig, h2: bool) -> Result<TlsAcceptor, ServerError> {
    let (certs, key) = match config {
        TlsConfig::Combined { pem } => read_combined(pem)?,
        TlsConfig::Split {
            private_key,
            certificate_chain,
        } => (read_certs(certificate_chain)?, read_key(private_key)?),
    };

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    server_config.alpn_protocols = if h2 {
        vec![b"h2".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open(path: &Path) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| ServerError::Tls(format!("{}: no private key found", path.display())))
}

/// A combined PEM file carries the certificate chain and the private key in
/// one stream, in any order.
fn read_combined(
    path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    let mut certs = Vec::new();
    let mut key = None;
    for item in rustls_pemfile::read_all(&mut open(path)?) {
        let item = item.map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?;
        match item {
            rustls_pemfile::Item::X509Certificate(cert) => certs.push(cert),
            rustls_pemfile::Item::Pkcs8Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::from(k));
            }
            rustls_pemfile::Item::Pkcs1Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::from(k));
            }
            rustls_pemfile::Item::Sec1Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::from(k));
            }
            _ => {}
        }
    }
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    let key =
        key.ok_or_else(|| ServerError::Tls(format!("{}: no private key found", path.display())))?;
    Ok((certs, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_is_a_tls_error() {
        let config = TlsConfig::Combined {
            pem: "/nonexistent/server.pem".into(),
        };
        assert!(matches!(
            build_acceptor(&config, false),
            Err(ServerError::Tls(_))
        ));
    }

    #[test]
    fn test_pem_without_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // A certificate-shaped block with no key alongside it.
        writeln!(
            file,
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----"
        )
        .unwrap();
        let config = TlsConfig::Combined {
            pem: file.path().into(),
        };
        let error = match build_acceptor(&config, true) {
            Ok(_) => panic!("expected build_acceptor to fail"),
            Err(e) => e,
        };
        assert!(matches!(error, ServerError::Tls(_)));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not pem at all").unwrap();
        let config = TlsConfig::Split {
            private_key: file.path().into(),
            certificate_chain: file.path().into(),
        };
        assert!(matches!(
            build_acceptor(&config, false),
            Err(ServerError::Tls(_))
        ));
    }
}
