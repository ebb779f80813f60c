// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Boot-time readiness check and schema seeding.

use super::schema::{TableSchema, APP_AXDB, OP_UPDATE_TABLE};
use super::{DatabaseClient, Params};
use crate::domain::error::{codes, AxError, AxResult};
use crate::infrastructure::retry::RetryConfig;
use std::time::Duration;
use tracing::{info, warn};

/// Default time the manager waits for AXDB before giving up.
pub const DATABASE_WAIT: Duration = Duration::from_secs(20 * 60);

const READINESS_TABLE: &str = "version";

/// Block until AXDB answers at all.
///
/// Any typed reply counts as reachable; only connection failures are retried.
pub async fn wait_until_ready(db: &dyn DatabaseClient, budget: Duration) -> AxResult<()> {
    let config = RetryConfig::connection_failures(budget);
    match db
        .get_with_time_retry(APP_AXDB, READINESS_TABLE, &Params::new(), &config)
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_code(codes::ERR_AX_HTTP_CONNECTION) || e.is_code(codes::ERR_TIMEOUT) => {
            warn!("AXDB still unreachable after {:?}: {}", budget, e);
            Err(e)
        }
        Err(_) => Ok(()),
    }
}

/// Create or update every table in `tables`.
pub async fn seed_tables(db: &dyn DatabaseClient, tables: &[TableSchema]) -> AxResult<()> {
    let config = RetryConfig::connection_failures(Duration::from_secs(5 * 60));
    for table in tables {
        let payload = serde_json::to_value(table)?;
        db.put_with_time_retry(APP_AXDB, OP_UPDATE_TABLE, &payload, &config)
            .await
            .map_err(|e| {
                AxError::new(
                    e.code().to_string(),
                    format!("Failed to seed table {}/{}: {}", table.app_name, table.name, e.message()),
                )
            })?;
    }
    info!("Seeded {} tables", tables.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::axdb::schema::{manager_tables, APP_AXAMM, TABLE_LABEL};
    use crate::infrastructure::axdb::{HttpDatabaseClient, InMemoryDatabase};

    #[tokio::test]
    async fn test_seed_registers_tables() {
        let db = InMemoryDatabase::new();
        assert!(db.get(APP_AXAMM, TABLE_LABEL, &Params::new()).await.is_err());

        wait_until_ready(&db, Duration::from_secs(1)).await.unwrap();
        seed_tables(&db, &manager_tables()).await.unwrap();
        assert!(db.get(APP_AXAMM, TABLE_LABEL, &Params::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_fails_when_unreachable() {
        let db = HttpDatabaseClient::with_timeout("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let err = wait_until_ready(&db, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_code(codes::ERR_AX_HTTP_CONNECTION) || err.is_code(codes::ERR_TIMEOUT));
    }
}
