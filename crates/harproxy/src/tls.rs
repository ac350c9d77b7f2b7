use std::io::BufReader;
use std::net::IpAddr;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{DnsName, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Loads `cert.pem`/`key.pem` from the given directory and builds a server
/// TLS acceptor. Failure here is non-fatal to the process: the HTTPS
/// listener simply never starts.
pub fn load_server_acceptor(dir: &std::path::Path) -> anyhow::Result<TlsAcceptor> {
	let cert_path = dir.join("cert.pem");
	let key_path = dir.join("key.pem");

	let cert_file = std::fs::File::open(&cert_path)
		.map_err(|e| anyhow::anyhow!("reading {}: {e}", cert_path.display()))?;
	let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<Vec<_>, _>>()?;

	let key_file = std::fs::File::open(&key_path)
		.map_err(|e| anyhow::anyhow!("reading {}: {e}", key_path.display()))?;
	let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?
		.ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

	let config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)?;

	Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the client-side TLS config used when the upstream call is to an
/// `https://` URI. Trust anchors come from the platform's native store.
pub fn client_config() -> anyhow::Result<Arc<ClientConfig>> {
	let mut roots = RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		// A handful of platform certs can fail to parse; skip rather than abort.
		let _ = roots.add(cert);
	}

	let config = ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	Ok(Arc::new(config))
}

pub async fn connect_upstream(tcp: TcpStream, config: Arc<ClientConfig>, host: &str, ip: IpAddr) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
	let server_name = DnsName::try_from(host.to_string())
		.map(ServerName::DnsName)
		.unwrap_or(ServerName::IpAddress(ip.into()));

	let connector = TlsConnector::from(config);
	let stream = connector.connect(server_name, tcp).await?;
	Ok(stream)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_config_builds_with_native_roots() {
		client_config().expect("native root store must be constructible");
	}

	#[test]
	fn missing_cert_files_error_cleanly() {
		let dir = std::env::temp_dir().join("harproxy-tls-test-missing");
		std::fs::create_dir_all(&dir).unwrap();
		let result = load_server_acceptor(&dir);
		assert!(result.is_err());
	}
}
