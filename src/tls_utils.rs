use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls_pemfile::{certs as pem_certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{Certificate, PrivateKey, server::ServerConfig};

use crate::config::TlsProfile;

/// Load PEM-encoded certificates from `path` and return them as `rustls::Certificate`.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
	let f = File::open(path).with_context(|| format!("opening cert file {}", path.display()))?;
	let mut reader = BufReader::new(f);
	let raw =
		pem_certs(&mut reader).map_err(|e| anyhow::anyhow!("failed to parse PEM certs: {}", e))?;
	if raw.is_empty() {
		anyhow::bail!("no certificates found in {}", path.display());
	}
	Ok(raw.into_iter().map(Certificate).collect())
}

/// Load a private key (PKCS#8 preferred, RSA fallback) from `path` and return it as `rustls::PrivateKey`.
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
	// Try PKCS#8 first
	let f = File::open(path).with_context(|| format!("opening key file {}", path.display()))?;
	let mut reader = BufReader::new(&f);
	let pks = pkcs8_private_keys(&mut reader)
		.map_err(|e| anyhow::anyhow!("failed to parse PKCS#8 keys: {}", e))?;
	if let Some(k) = pks.into_iter().next() {
		return Ok(PrivateKey(k));
	}

	// PKCS#8 not found; try RSA
	let f = File::open(path)
		.with_context(|| format!("opening key file {} (rsa pass)", path.display()))?;
	let mut reader = BufReader::new(f);
	let rs = rsa_private_keys(&mut reader)
		.map_err(|e| anyhow::anyhow!("failed to parse RSA keys: {}", e))?;
	if let Some(k) = rs.into_iter().next() {
		return Ok(PrivateKey(k));
	}

	anyhow::bail!("no private key found in {}", path.display());
}

/// Build a rustls `ServerConfig` for a decoy listener.
///
/// Decoys deliberately accept whatever certificate material a deployment
/// provides, self-signed included, and keep the default protocol range so
/// older scanners can still complete a handshake.
pub fn build_server_config(certs: Vec<Certificate>, key: PrivateKey) -> Result<Arc<ServerConfig>> {
	if certs.is_empty() {
		anyhow::bail!("no certificates provided to build server config");
	}

	let cfg = ServerConfig::builder()
		.with_safe_defaults()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|e| anyhow::anyhow!("failed to build server config: {}", e))?;

	Ok(Arc::new(cfg))
}

/// Resolve a named TLS profile into a ready acceptor.
pub fn acceptor_for_profile(profile: &TlsProfile) -> Result<TlsAcceptor> {
	let certs = load_certs(Path::new(&profile.certificate))?;
	let key = load_private_key(Path::new(&profile.key))?;
	let cfg = build_server_config(certs, key)?;
	Ok(TlsAcceptor::from(cfg))
}
