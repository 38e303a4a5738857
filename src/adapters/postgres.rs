//! # PostgreSQL Adapter
//!
//! One row per key: encoded value, its CAS token, the expiry timestamp
//! (NULL = never) and the recorded computation time. CAS maps directly onto
//! a conditional `UPDATE ... WHERE k = $1 AND t = $2`, so the database does
//! the compare and the swap in one statement.
//!
//! Expired rows are not removed on read; they linger as stale fallbacks
//! until a write to the same key needs the slot, or until the opportunistic
//! sweep (a small percentage of writes) clears them in bulk.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::config::DEFAULT_SWEEP_PROBABILITY;
use crate::error::Result;
use crate::expiry::{EarlyExpiration, Expiry};
use crate::store::{validate_collection_name, validate_key, Lookup, Store};
use crate::value::{decode, encode, token_for_encoded, StorageValue};

const TABLE: &str = "kvstash_items";

/// Collection names can't contain this, so prefixed keys never collide
/// with sibling collections or unprefixed keys.
const PREFIX_SEP: char = '\u{1f}';

/// Relational store backed by a PostgreSQL table.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    prefix: String,
    sweep_probability: u8,
    check: EarlyExpiration,
}

impl PostgresStore {
    /// Connect and make sure the backing table exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Build on an existing pool and make sure the backing table exists.
    pub async fn with_pool(pool: PgPool) -> Result<Self> {
        let store = Self {
            pool,
            prefix: String::new(),
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            check: EarlyExpiration::default(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Override the early-expiration sampler (deterministic in tests).
    pub fn with_early_expiration(mut self, check: EarlyExpiration) -> Self {
        self.check = check;
        self
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL,
                t TEXT NOT NULL,
                e TIMESTAMPTZ,
                ct BIGINT
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {TABLE}_expiry_idx ON {TABLE} (e) WHERE e IS NOT NULL"
        ))
        .execute(&self.pool)
        .await?;
        info!(table = TABLE, "cache table ready");
        Ok(())
    }

    fn row_key(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }

    fn expiry_column(normalized: i64) -> Option<DateTime<Utc>> {
        if normalized == 0 {
            None
        } else {
            DateTime::from_timestamp(normalized, 0)
        }
    }

    /// Every so often a write pays for a bulk sweep of expired rows.
    async fn maybe_sweep(&self) -> Result<()> {
        if rand::thread_rng().gen_range(0..100) >= self.sweep_probability {
            return Ok(());
        }
        let swept = sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE e IS NOT NULL AND e < now()"
        ))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if swept > 0 {
            debug!(rows = swept, "swept expired cache rows");
        }
        Ok(())
    }

    /// Drop the row for `row_key` if it exists but is expired, so that
    /// insert-if-absent sees the slot as free.
    async fn evict_expired_row(&self, row_key: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE k = $1 AND e IS NOT NULL AND e < now()"
        ))
        .bind(row_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert(
        &self,
        row_key: &str,
        value: &StorageValue,
        normalized: i64,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let encoded = encode(value)?;
        let token = token_for_encoded(&encoded);
        sqlx::query(&format!(
            "INSERT INTO {TABLE} (k, v, t, e, ct) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (k) DO UPDATE SET v = $2, t = $3, e = $4, ct = $5"
        ))
        .bind(row_key)
        .bind(&encoded)
        .bind(&token)
        .bind(Self::expiry_column(normalized))
        .bind(compute_micros.map(|ct| ct as i64))
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    fn lookup_from_row(&self, key: &str, row: &sqlx::postgres::PgRow) -> Result<Lookup> {
        let encoded: String = row.try_get("v")?;
        let token: String = row.try_get("t")?;
        let expiry = row
            .try_get::<Option<DateTime<Utc>>, _>("e")?
            .map_or(0, |e| e.timestamp());
        let compute_micros = row
            .try_get::<Option<i64>, _>("ct")?
            .map(|ct| ct as u64);
        let value = decode(&encoded)?;
        if self.check.is_expired(expiry, compute_micros) {
            Ok(Lookup::expired(key, value, token, expiry, compute_micros))
        } else {
            Ok(Lookup::hit(key, value, token, expiry, compute_micros))
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get(&self, key: &str) -> Result<Lookup> {
        let row_key = self.row_key(key)?;
        let row = sqlx::query(&format!("SELECT v, t, e, ct FROM {TABLE} WHERE k = $1"))
            .bind(&row_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => self.lookup_from_row(key, &row),
            None => Ok(Lookup::miss(key)),
        }
    }

    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let row_key = self.row_key(key)?;
        self.maybe_sweep().await?;
        let normalized = expire.normalize();
        if normalized != 0 && normalized < Utc::now().timestamp() {
            sqlx::query(&format!("DELETE FROM {TABLE} WHERE k = $1"))
                .bind(&row_key)
                .execute(&self.pool)
                .await?;
            return Ok(true);
        }
        self.upsert(&row_key, &value, normalized, compute_micros)
            .await
    }

    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let row_key = self.row_key(key)?;
        let normalized = expire.normalize();
        if normalized != 0 && normalized < Utc::now().timestamp() {
            // a CAS to the past is a conditional delete
            let rows = sqlx::query(&format!(
                "DELETE FROM {TABLE} WHERE k = $1 AND (t = $2 OR (e IS NOT NULL AND e < now()))"
            ))
            .bind(&row_key)
            .bind(token)
            .execute(&self.pool)
            .await?
            .rows_affected();
            // a key that wasn't there counts as success too
            if rows > 0 {
                return Ok(true);
            }
            return Ok(!self.get(key).await?.is_hit());
        }

        let encoded = encode(&value)?;
        let new_token = token_for_encoded(&encoded);
        let rows = sqlx::query(&format!(
            "UPDATE {TABLE} SET v = $3, t = $4, e = $5, ct = $6
             WHERE k = $1 AND (t = $2 OR (e IS NOT NULL AND e < now()))"
        ))
        .bind(&row_key)
        .bind(token)
        .bind(&encoded)
        .bind(&new_token)
        .bind(Self::expiry_column(normalized))
        .bind(compute_micros.map(|ct| ct as i64))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows > 0 {
            return Ok(true);
        }
        // no row matched: a miss accepts the write, a live mismatch fails
        if self.get(key).await?.is_hit() {
            return Ok(false);
        }
        self.upsert(&row_key, &value, normalized, compute_micros)
            .await
    }

    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        let row_key = self.row_key(key)?;
        self.maybe_sweep().await?;
        let normalized = expire.normalize();
        if normalized != 0 && normalized < Utc::now().timestamp() {
            sqlx::query(&format!("DELETE FROM {TABLE} WHERE k = $1"))
                .bind(&row_key)
                .execute(&self.pool)
                .await?;
            return Ok(true);
        }
        // an expired row must not block the insert
        self.evict_expired_row(&row_key).await?;
        let encoded = encode(&value)?;
        let token = token_for_encoded(&encoded);
        let rows = sqlx::query(&format!(
            "INSERT INTO {TABLE} (k, v, t, e, ct) VALUES ($1, $2, $3, $4, NULL)
             ON CONFLICT (k) DO NOTHING"
        ))
        .bind(&row_key)
        .bind(&encoded)
        .bind(&token)
        .bind(Self::expiry_column(normalized))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let row_key = self.row_key(key)?;
        let row = sqlx::query(&format!("DELETE FROM {TABLE} WHERE k = $1 RETURNING e"))
            .bind(&row_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            // deleting an already-expired row doesn't count as a delete
            Some(row) => {
                let e = row.try_get::<Option<DateTime<Utc>>, _>("e")?;
                Ok(e.map_or(true, |e| e.timestamp() >= Utc::now().timestamp()))
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<bool> {
        if self.prefix.is_empty() {
            sqlx::query(&format!("DELETE FROM {TABLE}"))
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(&format!(
                "DELETE FROM {TABLE} WHERE starts_with(k, $1)"
            ))
            .bind(&self.prefix)
            .execute(&self.pool)
            .await?;
        }
        Ok(true)
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn Store>> {
        validate_collection_name(name)?;
        Ok(Arc::new(PostgresStore {
            pool: self.pool.clone(),
            prefix: format!("{}{}{}", self.prefix, name, PREFIX_SEP),
            sweep_probability: self.sweep_probability,
            check: self.check.clone(),
        }))
    }

    async fn get_multiple(
        &self,
        keys: &[&str],
    ) -> Result<std::collections::HashMap<String, (StorageValue, String)>> {
        let row_keys = keys
            .iter()
            .map(|key| self.row_key(key))
            .collect::<Result<Vec<_>>>()?;
        let rows = sqlx::query(&format!(
            "SELECT k, v, t, e, ct FROM {TABLE} WHERE k = ANY($1)"
        ))
        .bind(&row_keys)
        .fetch_all(&self.pool)
        .await?;
        let mut found = std::collections::HashMap::new();
        for row in rows {
            let row_key: String = row.try_get("k")?;
            let key = row_key
                .strip_prefix(&self.prefix)
                .unwrap_or(&row_key)
                .to_string();
            let lookup = self.lookup_from_row(&key, &row)?;
            if let (Some(value), Some(token)) = (lookup.value, lookup.token) {
                found.insert(key, (value, token));
            }
        }
        Ok(found)
    }
}

// These need a live database; run them with
// KVSTASH_TEST_DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreExt;

    async fn store() -> PostgresStore {
        let url = std::env::var("KVSTASH_TEST_DATABASE_URL")
            .expect("KVSTASH_TEST_DATABASE_URL must point at a test database");
        let store = PostgresStore::connect(&url).await.unwrap();
        store.clear().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore]
    async fn test_round_trip_and_cas() {
        let pg = store().await;
        assert!(pg
            .set("k", StorageValue::from("v1"), Expiry::Never)
            .await
            .unwrap());
        let lookup = pg.get("k").await.unwrap();
        assert!(lookup.is_hit());
        let token = lookup.token.unwrap();

        assert!(pg
            .cas(&token, "k", StorageValue::from("v2"), Expiry::Never)
            .await
            .unwrap());
        assert!(!pg
            .cas(&token, "k", StorageValue::from("v3"), Expiry::Never)
            .await
            .unwrap());
        assert_eq!(
            pg.get_value("k").await.unwrap(),
            Some(StorageValue::from("v2"))
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_add_and_expired_row_reuse() {
        let pg = store().await;
        assert!(pg
            .add("slot", StorageValue::from(1i64), Expiry::from(-10))
            .await
            .unwrap());
        // writing to the past left nothing behind, so add succeeds
        assert!(pg
            .add("slot", StorageValue::from(2i64), Expiry::Never)
            .await
            .unwrap());
        assert!(!pg
            .add("slot", StorageValue::from(3i64), Expiry::Never)
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_collection_isolation() {
        let pg = store().await;
        let scoped = pg.collection("tenants").unwrap();
        scoped
            .set("k", StorageValue::from("inner"), Expiry::Never)
            .await
            .unwrap();
        pg.set("k", StorageValue::from("outer"), Expiry::Never)
            .await
            .unwrap();

        scoped.clear().await.unwrap();
        assert!(scoped.get("k").await.unwrap().value.is_none());
        assert!(pg.get("k").await.unwrap().is_hit());
    }
}
