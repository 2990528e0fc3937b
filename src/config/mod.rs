use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Substitution slot in `prompt_template` that receives the raw request
/// dump. The template must contain it exactly once.
pub const PROMPT_SLOT: &str = "%s";

/// Default completion endpoint; any chat-completions compatible API with
/// the same wire shape can be substituted via `api_url`.
pub const DEFAULT_API_URL: &str = "https://api.perplexity.ai/chat/completions";

fn default_api_url() -> String {
	DEFAULT_API_URL.to_string()
}

fn default_cache_duration_hours() -> u64 {
	24
}

/// Wire protocol served on a decoy port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Tls,
}

/// One decoy listener. `tls_profile` names an entry in [`Settings::tls`]
/// and is required when `protocol` is `tls`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortConfig {
	pub port: u16,
	pub protocol: Protocol,
	#[serde(default)]
	pub tls_profile: Option<String>,
}

/// Certificate material for a named TLS profile. Self-signed certificates
/// are acceptable here; scanners are the only clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsProfile {
	pub certificate: String,
	pub key: String,
}

/// Runtime configuration for Loki.
///
/// Values are loaded from the YAML file named on the command line, overlaid
/// with environment variables prefixed `LOKI_` (e.g. `LOKI_API_KEY`), then
/// validated as a whole.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub ports: Vec<PortConfig>,
	#[serde(default)]
	pub tls: HashMap<String, TlsProfile>,
	pub model: String,
	pub api_key: String,
	#[serde(default = "default_api_url")]
	pub api_url: String,
	pub prompt_template: String,
	#[serde(default = "default_cache_duration_hours")]
	pub cache_duration_hours: u64,
}

impl Settings {
	/// Reject configurations that would only fail later, mid-serve.
	pub fn validate(&self) -> Result<()> {
		if self.ports.is_empty() {
			bail!("no ports configured");
		}
		for pc in &self.ports {
			if pc.protocol != Protocol::Tls {
				continue;
			}
			let name = match pc.tls_profile.as_deref() {
				Some(n) if !n.is_empty() => n,
				_ => bail!("port {}: tls protocol requires a tls profile", pc.port),
			};
			let profile = self
				.tls
				.get(name)
				.with_context(|| format!("port {}: tls profile {:?} is not defined", pc.port, name))?;
			if profile.certificate.is_empty() || profile.key.is_empty() {
				bail!(
					"port {}: tls profile {:?} must name both a certificate and a key",
					pc.port,
					name
				);
			}
		}
		let slots = self.prompt_template.matches(PROMPT_SLOT).count();
		if slots != 1 {
			bail!(
				"prompt_template must contain the {} slot exactly once (found {})",
				PROMPT_SLOT,
				slots
			);
		}
		Ok(())
	}
}

/// Load and validate settings from `path` plus `LOKI_`-prefixed
/// environment variables.
pub fn load(path: &Path) -> Result<Settings> {
	let cfg = config::Config::builder()
		.add_source(config::File::from(path))
		// Double-underscore separator so single-underscore keys like
		// `LOKI_API_KEY` map to `api_key` instead of nested `api.key`.
		.add_source(config::Environment::with_prefix("LOKI").separator("__"))
		.build()
		.with_context(|| format!("loading config from {}", path.display()))?;

	let settings: Settings = cfg
		.try_deserialize()
		.with_context(|| format!("parsing config from {}", path.display()))?;
	settings.validate()?;
	Ok(settings)
}
