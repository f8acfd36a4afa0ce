use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::Config;

/// TLS acceptor from the configured PEM files, or `None` for plaintext.
/// Setting only one of the two paths is a configuration error.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "SAMAY_TLS_CERT and SAMAY_TLS_KEY must be set together",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {cert_path}"),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, format!("no private key in {key_path}"))
        })?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_when_unset() {
        assert!(load_tls_acceptor(&Config::default()).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        let config = Config {
            tls_cert: Some("/nonexistent/cert.pem".into()),
            ..Config::default()
        };
        let err = load_tls_acceptor(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("SAMAY_TLS_KEY"));
    }

    #[test]
    fn missing_files_surface_io_errors() {
        let config = Config {
            tls_cert: Some("/nonexistent/cert.pem".into()),
            tls_key: Some("/nonexistent/key.pem".into()),
            ..Config::default()
        };
        let err = load_tls_acceptor(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
