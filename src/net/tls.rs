use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::{CertificateDer, ServerName};

use crate::net::ws::WsError;

/// System CA bundles probed when no explicit file is configured.
const CA_BUNDLE_CANDIDATES: [&str; 3] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/cert.pem",
];

pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

pub fn client_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>, WsError> {
    let bundle = match ca_file {
        Some(path) => path.to_path_buf(),
        None => default_bundle()?,
    };
    let certs = load_certificates(&bundle)?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(WsError::Tls(format!(
            "no usable certificates in {}",
            bundle.display()
        )));
    }
    if ignored > 0 {
        log::debug!("ignored {ignored} unparsable certificates in {}", bundle.display());
    }

    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| WsError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn wrap(tcp: TcpStream, host: &str, config: Arc<ClientConfig>) -> Result<TlsStream, WsError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|err| WsError::Tls(format!("invalid server name '{host}': {err}")))?;
    let connection =
        ClientConnection::new(config, server_name).map_err(|err| WsError::Tls(err.to_string()))?;
    Ok(StreamOwned::new(connection, tcp))
}

fn default_bundle() -> Result<PathBuf, WsError> {
    CA_BUNDLE_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| WsError::Tls("no system CA bundle found; set ca_file".to_string()))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, WsError> {
    let file = File::open(path)
        .map_err(|err| WsError::Tls(format!("open {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| WsError::Tls(format!("parse {}: {err}", path.display())))
}
