use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS cache ( \
	id INTEGER PRIMARY KEY AUTOINCREMENT, \
	cached_at INTEGER NOT NULL, \
	key TEXT NOT NULL, \
	response BLOB NOT NULL \
)";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS cache_key_idx ON cache (key, cached_at)";

/// Outcome of a cache probe. `Expired` entries stay on disk; the handler
/// treats them like a miss and overwrites with a fresh synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
	Hit(Vec<u8>),
	Expired,
	Miss,
}

/// Durable response store keyed by `<port>_<uri>`.
///
/// Writes insert new rows; reads take the row with the largest `cached_at`
/// for the key, so the latest write wins without any key-level locking.
#[derive(Debug, Clone)]
pub struct ResponseCache {
	pool: SqlitePool,
	ttl_secs: i64,
}

impl ResponseCache {
	/// Open (creating if missing) the cache database at `path`.
	pub async fn open(path: &Path, ttl_hours: u64) -> Result<Self, sqlx::Error> {
		let opts = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.busy_timeout(Duration::from_secs(5));
		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(opts)
			.await?;
		Self::init(pool, ttl_hours).await
	}

	/// In-process database for tests. A single connection keeps the
	/// `:memory:` store shared across the pool.
	pub async fn open_in_memory(ttl_hours: u64) -> Result<Self, sqlx::Error> {
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await?;
		Self::init(pool, ttl_hours).await
	}

	async fn init(pool: SqlitePool, ttl_hours: u64) -> Result<Self, sqlx::Error> {
		sqlx::query(CREATE_TABLE).execute(&pool).await?;
		sqlx::query(CREATE_INDEX).execute(&pool).await?;
		Ok(Self {
			pool,
			ttl_secs: ttl_hours as i64 * 3600,
		})
	}

	/// Fetch the most recent entry for `key`, applying the TTL rule
	/// against `now`.
	pub async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Lookup, sqlx::Error> {
		let row: Option<(i64, Vec<u8>)> = sqlx::query_as(
			"SELECT cached_at, response FROM cache \
			 WHERE key = ?1 ORDER BY cached_at DESC, id DESC LIMIT 1",
		)
		.bind(key)
		.fetch_optional(&self.pool)
		.await?;

		Ok(match row {
			None => Lookup::Miss,
			Some((cached_at, response)) => {
				if now.timestamp() - cached_at > self.ttl_secs {
					Lookup::Expired
				} else {
					Lookup::Hit(response)
				}
			}
		})
	}

	/// Record `response` for `key` as of `now`.
	pub async fn put(&self, key: &str, response: &[u8], now: DateTime<Utc>) -> Result<(), sqlx::Error> {
		sqlx::query("INSERT INTO cache (cached_at, key, response) VALUES (?1, ?2, ?3)")
			.bind(now.timestamp())
			.bind(key)
			.bind(response)
			.execute(&self.pool)
			.await?;
		Ok(())
	}
}
