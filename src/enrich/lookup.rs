use std::net::IpAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use log::debug;
use once_cell::sync::Lazy;

use super::{EnrichmentInfo, SourceLookup};

/// Published address ranges of recognized internet-wide scanning
/// services. Matched before the reverse-DNS suffix table since many
/// scanner addresses have no PTR record at all.
static SCANNER_NETS: Lazy<Vec<(IpNet, &'static str)>> = Lazy::new(|| {
	[
		("71.6.128.0/17", "shodan"),
		("66.240.192.0/18", "shodan"),
		("162.142.125.0/24", "censys"),
		("167.94.138.0/24", "censys"),
		("167.248.133.0/24", "censys"),
		("74.120.14.0/24", "censys"),
		("184.105.139.64/26", "shadowserver"),
		("74.82.47.0/26", "shadowserver"),
		("89.248.160.0/21", "netsystems-research"),
	]
	.iter()
	.filter_map(|(net, tag)| net.parse().ok().map(|n| (n, *tag)))
	.collect()
});

/// Reverse-DNS suffixes of scanning services that announce themselves.
const SCANNER_SUFFIXES: &[(&str, &str)] = &[
	(".shodan.io", "shodan"),
	(".census.shodan.io", "shodan"),
	(".censys-scanner.com", "censys"),
	(".binaryedge.ninja", "binaryedge"),
	(".stretchoid.com", "stretchoid"),
	(".shadowserver.org", "shadowserver"),
	(".internet-measurement.com", "driftnet"),
];

/// Enrichment source backed by reverse DNS plus the static scanner
/// tables above.
pub struct DnsScannerLookup {
	resolver: TokioAsyncResolver,
}

impl DnsScannerLookup {
	pub fn from_system_conf() -> Result<Self> {
		let resolver = TokioAsyncResolver::tokio_from_system_conf()
			.context("building DNS resolver from system configuration")?;
		Ok(Self { resolver })
	}

	fn scanner_by_net(ip: IpAddr) -> Option<&'static str> {
		SCANNER_NETS
			.iter()
			.find(|(net, _)| net.contains(&ip))
			.map(|(_, tag)| *tag)
	}

	fn scanner_by_host(host: &str) -> Option<&'static str> {
		if host.is_empty() {
			return None;
		}
		SCANNER_SUFFIXES
			.iter()
			.find(|(suffix, _)| host.ends_with(suffix))
			.map(|(_, tag)| *tag)
	}
}

#[async_trait]
impl SourceLookup for DnsScannerLookup {
	async fn lookup(&self, ip: IpAddr) -> Result<EnrichmentInfo> {
		// Scanners without PTR records are the norm; an empty host is a
		// valid answer, not an error.
		let host = match self.resolver.reverse_lookup(ip).await {
			Ok(names) => names
				.iter()
				.next()
				.map(|name| name.to_string().trim_end_matches('.').to_string())
				.unwrap_or_default(),
			Err(e) => {
				debug!("reverse lookup for {} failed: {}", ip, e);
				String::new()
			}
		};

		let known_scanner = Self::scanner_by_net(ip)
			.or_else(|| Self::scanner_by_host(&host))
			.map(str::to_string)
			.unwrap_or_default();

		Ok(EnrichmentInfo { host, known_scanner })
	}
}
