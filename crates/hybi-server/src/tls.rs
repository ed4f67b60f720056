//! TLS setup: PEM loading and self-signed development certificates.

use hybi_core::{HybiError, HybiResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Subject names a development certificate covers.
const DEV_CERT_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Build a rustls server config from a PEM certificate chain and private key.
pub fn load_server_config(cert: &Path, key: &Path) -> HybiResult<rustls::ServerConfig> {
    let chain = read_chain(cert)?;
    let key = read_key(key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .and_then(|builder| builder.with_no_client_auth().with_single_cert(chain, key))
        .map_err(|e| HybiError::Config(format!("TLS setup failed: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn read_pem(path: &Path, what: &str) -> HybiResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| HybiError::Config(format!("cannot read {what} {}: {e}", path.display())))
}

fn read_chain(path: &Path) -> HybiResult<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path, "certificate")?;
    let chain = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HybiError::Config(format!("bad certificate PEM {}: {e}", path.display())))?;
    if chain.is_empty() {
        return Err(HybiError::Config(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn read_key(path: &Path) -> HybiResult<PrivateKeyDer<'static>> {
    let pem = read_pem(path, "key")?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| HybiError::Config(format!("bad key PEM {}: {e}", path.display())))?
        .ok_or_else(|| HybiError::Config(format!("no private key in {}", path.display())))
}

/// Where `--generate-cert` writes its files.
pub fn dev_cert_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".hybi")
}

/// Write a fresh self-signed certificate and key into `dir` as `cert.pem`
/// and `key.pem`, returning both paths.
pub fn generate_dev_cert(dir: &Path) -> HybiResult<(PathBuf, PathBuf)> {
    let rcgen_err = |e: rcgen::Error| HybiError::Config(format!("certificate generation failed: {e}"));

    let names: Vec<String> = DEV_CERT_NAMES.iter().map(|n| n.to_string()).collect();
    let mut params = rcgen::CertificateParams::new(names).map_err(rcgen_err)?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "hybi-server dev cert");
    let key_pair = rcgen::KeyPair::generate().map_err(rcgen_err)?;
    let cert = params.self_signed(&key_pair).map_err(rcgen_err)?;

    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    Ok((cert_path, key_path))
}
