use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::TlsAcceptor;

/// Load a PEM keypair and build the acceptor for the TLS listening surface.
/// Certificate provisioning itself is an external concern; we only consume
/// the files.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
	let certs = rustls_pemfile::certs(&mut BufReader::new(
		File::open(cert_path).with_context(|| format!("open cert {}", cert_path.display()))?,
	))
	.collect::<Result<Vec<_>, _>>()
	.context("parse certificates")?;
	let key = rustls_pemfile::private_key(&mut BufReader::new(
		File::open(key_path).with_context(|| format!("open key {}", key_path.display()))?,
	))
	.context("parse private key")?
	.context("no private key found")?;
	let config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.context("build TLS config")?;
	Ok(TlsAcceptor::from(Arc::new(config)))
}
