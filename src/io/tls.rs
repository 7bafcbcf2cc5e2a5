use crate::common::Result;
use rustls::{Certificate, PrivateKey, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Build a TLS server config from a PEM encoded certificate chain and a
/// PKCS8 private key file.
///
/// Generate a self signed pair for testing with openssl:
/// ```bash
/// openssl req -new -newkey rsa:4096 -x509 -sha256 -days 365 -nodes \
///     -out smtpin.crt -keyout smtpin.key
/// ```
pub fn tls_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<ServerConfig> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_file =
        File::open(cert_path).map_err(|e| format!("could not open {:?}: {}", cert_path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .map_err(|e| format!("could not parse certificates from {:?}: {}", cert_path, e))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(format!("no certificates found in {:?}", cert_path).into());
    }

    let key_file =
        File::open(key_path).map_err(|e| format!("could not open {:?}: {}", key_path, e))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
        .map_err(|e| format!("could not parse private key from {:?}: {}", key_path, e))?;
    if keys.is_empty() {
        return Err(format!("no private key found in {:?}", key_path).into());
    }

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKey(keys.remove(0)))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("smtpin-tls-test-{}", name));
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_cert_file_is_reported() {
        let err = tls_config_from_pem("/definitely/not/here.crt", "/nor/here.key")
            .err()
            .expect("must fail");
        assert!(err.to_string().contains("could not open"));
    }

    #[test]
    fn cert_file_without_certificates_is_reported() {
        let cert = scratch_file("empty.crt", "not a pem at all\n");
        let key = scratch_file("empty.key", "");
        let err = tls_config_from_pem(&cert, &key).err().expect("must fail");
        assert!(
            err.to_string().contains("no certificates found"),
            "got: {}",
            err
        );
    }
}
