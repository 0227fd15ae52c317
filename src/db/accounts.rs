use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgPool;

/// Resolves account-address strings to internal account ids.
///
/// The account registry is maintained by a separate pipeline stage; chain
/// data may reference addresses that are not indexed yet, so every requested
/// address maps to `Some(id)` or `None` rather than failing the batch.
#[async_trait]
pub trait AccountLookup: Send + Sync {
    async fn resolve(
        &self,
        addresses: &HashSet<String>,
    ) -> eyre::Result<HashMap<String, Option<i64>>>;
}

/// Lookup against the `accounts` table.
pub struct PgAccountLookup {
    pool: PgPool,
}

impl PgAccountLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountLookup for PgAccountLookup {
    async fn resolve(
        &self,
        addresses: &HashSet<String>,
    ) -> eyre::Result<HashMap<String, Option<i64>>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let wanted: Vec<String> = addresses.iter().cloned().collect();
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT address, id FROM accounts WHERE address = ANY($1)")
                .bind(&wanted)
                .fetch_all(&self.pool)
                .await?;

        let mut resolved: HashMap<String, Option<i64>> =
            addresses.iter().map(|address| (address.clone(), None)).collect();
        for (address, id) in rows {
            resolved.insert(address, Some(id));
        }
        Ok(resolved)
    }
}
