// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::str::FromStr;

use async_trait::async_trait;
use plexus_common::model::{ProviderId, ProviderKind, Resources};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::config::LedgerDbConfig;

/// Row persisted for every locally owned provider so a restarted peer
/// recovers its known provider set without waiting for re-registration.
/// Allocation numbers are deliberately not persisted; workflows in flight
/// at restart are failed and reservations start from zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    pub provider_id: ProviderId,
    pub kind: ProviderKind,
    pub address: String,
    pub capacity: Resources,
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt provider record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ProviderRepo: Send + Sync {
    async fn upsert(&self, record: &ProviderRecord) -> Result<(), RepoError>;
    async fn delete(&self, provider_id: &ProviderId) -> Result<(), RepoError>;
    async fn get_all(&self) -> Result<Vec<ProviderRecord>, RepoError>;
}

pub struct DbProviderRepo {
    pool: SqlitePool,
}

impl DbProviderRepo {
    pub async fn configured(config: &LedgerDbConfig) -> Result<Self, RepoError> {
        let options = SqliteConnectOptions::from_str(&config.database)
            .map_err(RepoError::Db)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                provider_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                address TEXT NOT NULL,
                millicpu INTEGER NOT NULL,
                memory_bytes INTEGER NOT NULL,
                gpus INTEGER NOT NULL,
                tags TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ProviderRepo for DbProviderRepo {
    async fn upsert(&self, record: &ProviderRecord) -> Result<(), RepoError> {
        let tags = serde_json::to_string(&record.capacity.tags)
            .map_err(|err| RepoError::Corrupt(err.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO providers (provider_id, kind, address, millicpu, memory_bytes, gpus, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_id) DO UPDATE
            SET kind = $2, address = $3, millicpu = $4, memory_bytes = $5, gpus = $6, tags = $7
            "#,
        )
        .bind(record.provider_id.to_string())
        .bind(record.kind.as_str())
        .bind(&record.address)
        .bind(record.capacity.millicpu)
        .bind(record.capacity.memory_bytes)
        .bind(record.capacity.gpus)
        .bind(tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, provider_id: &ProviderId) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM providers WHERE provider_id = $1")
            .bind(provider_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<ProviderRecord>, RepoError> {
        let rows = sqlx::query("SELECT provider_id, kind, address, millicpu, memory_bytes, gpus, tags FROM providers")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let tags: String = row.get("tags");
                let tags = serde_json::from_str(&tags)
                    .map_err(|err| RepoError::Corrupt(err.to_string()))?;
                Ok(ProviderRecord {
                    provider_id: ProviderId::new(row.get::<String, _>("provider_id")),
                    kind: ProviderKind::from_str(&kind).map_err(RepoError::Corrupt)?,
                    address: row.get("address"),
                    capacity: Resources {
                        millicpu: row.get("millicpu"),
                        memory_bytes: row.get("memory_bytes"),
                        gpus: row.get("gpus"),
                        tags,
                    },
                })
            })
            .collect()
    }
}

/// No-op repo for setups that do not want the catalog to survive restarts.
pub struct NoopProviderRepo;

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    async fn memory_repo() -> DbProviderRepo {
        DbProviderRepo::configured(&LedgerDbConfig {
            database: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
        .unwrap()
    }

    fn record(id: &str) -> ProviderRecord {
        ProviderRecord {
            provider_id: ProviderId::new(id),
            kind: ProviderKind::ContainerHost,
            address: "10.0.0.5".to_string(),
            capacity: Resources::new(8000, 16 << 30, 1)
                .with_tags(vec!["avx512".to_string()]),
        }
    }

    #[test]
    async fn upsert_and_reload_roundtrips() {
        let repo = memory_repo().await;
        repo.upsert(&record("prov-a")).await.unwrap();
        repo.upsert(&record("prov-b")).await.unwrap();

        let mut updated = record("prov-a");
        updated.capacity.millicpu = 4000;
        repo.upsert(&updated).await.unwrap();

        let mut all = repo.get_all().await.unwrap();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], updated);
        assert_eq!(all[1], record("prov-b"));
    }

    #[test]
    async fn delete_removes_the_record() {
        let repo = memory_repo().await;
        repo.upsert(&record("prov-a")).await.unwrap();
        repo.delete(&ProviderId::new("prov-a")).await.unwrap();
        assert!(repo.get_all().await.unwrap().is_empty());
    }
}

#[async_trait]
impl ProviderRepo for NoopProviderRepo {
    async fn upsert(&self, _record: &ProviderRecord) -> Result<(), RepoError> {
        Ok(())
    }

    async fn delete(&self, _provider_id: &ProviderId) -> Result<(), RepoError> {
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<ProviderRecord>, RepoError> {
        Ok(Vec::new())
    }
}
