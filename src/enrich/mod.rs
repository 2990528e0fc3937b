pub mod lookup;

pub use lookup::DnsScannerLookup;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Upper bound on cached source addresses. A full internet-wide scan is
/// far smaller than this; the bound exists so a spoofed-source flood
/// cannot grow the map without limit.
pub const CACHE_CAPACITY: u64 = 1_000_000;

/// How long a resolved entry stays valid.
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Metadata derived for a source IP. Either field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentInfo {
	pub host: String,
	pub known_scanner: String,
}

/// Backing data source for enrichment. The production implementation is
/// [`DnsScannerLookup`]; tests substitute in-memory tables.
#[async_trait]
pub trait SourceLookup: Send + Sync {
	async fn lookup(&self, ip: IpAddr) -> Result<EnrichmentInfo>;
}

/// Bounded LRU+TTL cache in front of a [`SourceLookup`].
pub struct Enricher {
	cache: moka::future::Cache<IpAddr, EnrichmentInfo>,
	source: Arc<dyn SourceLookup>,
}

impl Enricher {
	pub fn new(source: Arc<dyn SourceLookup>) -> Self {
		let cache = moka::future::Cache::builder()
			.max_capacity(CACHE_CAPACITY)
			.time_to_live(CACHE_TTL)
			.build();
		Self { cache, source }
	}

	/// Resolve enrichment for `ip`, serving repeats from the cache.
	/// Lookup failures are returned to the caller and never cached, so a
	/// transient resolver outage does not poison an address for an hour.
	pub async fn process(&self, ip: IpAddr) -> Result<EnrichmentInfo> {
		if let Some(info) = self.cache.get(&ip).await {
			return Ok(info);
		}
		let info = self.source.lookup(ip).await?;
		self.cache.insert(ip, info.clone()).await;
		Ok(info)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::bail;
	use std::sync::atomic::{AtomicU32, Ordering};

	struct CountingLookup {
		calls: AtomicU32,
		fail: bool,
	}

	#[async_trait]
	impl SourceLookup for CountingLookup {
		async fn lookup(&self, ip: IpAddr) -> Result<EnrichmentInfo> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				bail!("lookup backend unavailable");
			}
			Ok(EnrichmentInfo {
				host: format!("host-for-{}", ip),
				known_scanner: "shodan".to_string(),
			})
		}
	}

	#[tokio::test]
	async fn repeated_lookups_are_served_from_cache() {
		let source = Arc::new(CountingLookup {
			calls: AtomicU32::new(0),
			fail: false,
		});
		let enricher = Enricher::new(source.clone());
		let ip: IpAddr = "203.0.113.7".parse().unwrap();

		let first = enricher.process(ip).await.unwrap();
		let second = enricher.process(ip).await.unwrap();
		assert_eq!(first, second);
		assert_eq!(first.known_scanner, "shodan");
		assert_eq!(source.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn distinct_addresses_resolve_independently() {
		let source = Arc::new(CountingLookup {
			calls: AtomicU32::new(0),
			fail: false,
		});
		let enricher = Enricher::new(source.clone());

		enricher.process("203.0.113.7".parse().unwrap()).await.unwrap();
		enricher.process("203.0.113.8".parse().unwrap()).await.unwrap();
		assert_eq!(source.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn failures_are_not_cached() {
		let source = Arc::new(CountingLookup {
			calls: AtomicU32::new(0),
			fail: true,
		});
		let enricher = Enricher::new(source.clone());
		let ip: IpAddr = "203.0.113.9".parse().unwrap();

		assert!(enricher.process(ip).await.is_err());
		assert!(enricher.process(ip).await.is_err());
		// Each attempt reached the backend; nothing was memoized.
		assert_eq!(source.calls.load(Ordering::SeqCst), 2);
	}
}
