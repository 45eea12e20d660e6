//! Asset and job records.
//!
//! Every mutation is a targeted update so that the dispatcher, the variant
//! tracker and the verifier never overwrite each other's fields.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::FromRow;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{Asset, AssetState, Job, JobState};
use crate::infrastructure::db::pool::DbPool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record not found: {0}")]
    NotFound(Uuid),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Inserts the asset and its job, linking the asset to the job.
    async fn create(&self, asset: &Asset, job: &Job) -> Result<(), StoreError>;

    async fn get_asset(&self, id: Uuid) -> Result<Option<Asset>, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn set_asset_state(&self, id: Uuid, state: AssetState) -> Result<(), StoreError>;

    /// Set union of `variant` into `uploaded_variants`, only if the asset
    /// expects it. Returns the asset as stored afterwards.
    async fn add_uploaded_variant(&self, id: Uuid, variant: &str) -> Result<Asset, StoreError>;

    async fn set_job_state(
        &self,
        id: Uuid,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Raises progress; lower values and non-encoding jobs are ignored.
    async fn raise_job_progress(&self, id: Uuid, position_secs: f64) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryTables {
    assets: HashMap<Uuid, Asset>,
    jobs: HashMap<Uuid, Job>,
}

#[derive(Clone, Default)]
pub struct MemoryAssetStore {
    tables: Arc<RwLock<MemoryTables>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn create(&self, asset: &Asset, job: &Job) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let mut asset = asset.clone();
        asset.job_id = Some(job.id);
        tables.assets.insert(asset.id, asset);
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_asset(&self, id: Uuid) -> Result<Option<Asset>, StoreError> {
        Ok(self.tables.read().assets.get(&id).cloned())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.tables.read().jobs.get(&id).cloned())
    }

    async fn set_asset_state(&self, id: Uuid, state: AssetState) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let asset = tables.assets.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        asset.state = state;
        asset.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn add_uploaded_variant(&self, id: Uuid, variant: &str) -> Result<Asset, StoreError> {
        let mut tables = self.tables.write();
        let asset = tables.assets.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if asset.record_uploaded(variant) {
            asset.updated_at = OffsetDateTime::now_utc();
        }
        Ok(asset.clone())
    }

    async fn set_job_state(
        &self,
        id: Uuid,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.state = state;
        job.error = error;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn raise_job_progress(&self, id: Uuid, position_secs: f64) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.state == JobState::Encoding && position_secs > job.progress_secs {
            job.progress_secs = position_secs;
            job.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    id UUID PRIMARY KEY,
    title TEXT NOT NULL,
    state TEXT NOT NULL,
    variants TEXT[] NOT NULL,
    uploaded_variants TEXT[] NOT NULL DEFAULT '{}',
    subtitles TEXT NOT NULL DEFAULT '{}',
    source_duration DOUBLE PRECISION NOT NULL,
    encryption_key BYTEA NOT NULL,
    encryption_iv BYTEA NOT NULL,
    job_id UUID,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    asset_id UUID NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    descriptor TEXT NOT NULL,
    variants TEXT[] NOT NULL,
    state TEXT NOT NULL,
    progress_secs DOUBLE PRECISION NOT NULL DEFAULT 0,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

#[derive(Debug, FromRow)]
struct AssetRow {
    id: Uuid,
    title: String,
    state: String,
    variants: Vec<String>,
    uploaded_variants: Vec<String>,
    subtitles: String,
    source_duration: f64,
    encryption_key: Vec<u8>,
    encryption_iv: Vec<u8>,
    job_id: Option<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<AssetRow> for Asset {
    type Error = StoreError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        let state = row.state.parse().map_err(StoreError::Corrupt)?;
        let subtitles: BTreeMap<String, String> = serde_json::from_str(&row.subtitles)
            .map_err(|e| StoreError::Corrupt(format!("asset {} subtitles: {e}", row.id)))?;
        let encryption_key: [u8; 16] = row
            .encryption_key
            .try_into()
            .map_err(|_| StoreError::Corrupt(format!("asset {} key length", row.id)))?;
        let encryption_iv: [u8; 16] = row
            .encryption_iv
            .try_into()
            .map_err(|_| StoreError::Corrupt(format!("asset {} iv length", row.id)))?;

        Ok(Asset {
            id: row.id,
            title: row.title,
            state,
            variants: row.variants,
            uploaded_variants: row.uploaded_variants.into_iter().collect::<BTreeSet<_>>(),
            subtitles,
            source_duration: row.source_duration,
            encryption_key,
            encryption_iv,
            job_id: row.job_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    asset_id: Uuid,
    descriptor: String,
    variants: Vec<String>,
    state: String,
    progress_secs: f64,
    error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            asset_id: row.asset_id,
            descriptor: serde_json::from_str(&row.descriptor)
                .map_err(|e| StoreError::Corrupt(format!("job {} descriptor: {e}", row.id)))?,
            variants: row.variants,
            state: row.state.parse().map_err(StoreError::Corrupt)?,
            progress_secs: row.progress_secs,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgAssetStore {
    pool: DbPool,
}

impl PgAssetStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AssetStore for PgAssetStore {
    async fn create(&self, asset: &Asset, job: &Job) -> Result<(), StoreError> {
        let subtitles = serde_json::to_string(&asset.subtitles)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let uploaded: Vec<String> = asset.uploaded_variants.iter().cloned().collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO assets (id, title, state, variants, uploaded_variants, subtitles,
                                source_duration, encryption_key, encryption_iv, job_id,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(asset.id)
        .bind(&asset.title)
        .bind(asset.state.as_str())
        .bind(&asset.variants)
        .bind(&uploaded)
        .bind(subtitles)
        .bind(asset.source_duration)
        .bind(asset.encryption_key.to_vec())
        .bind(asset.encryption_iv.to_vec())
        .bind(job.id)
        .bind(asset.created_at)
        .bind(asset.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, asset_id, descriptor, variants, state, progress_secs, error,
                              created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(job.asset_id)
        .bind(job.descriptor.to_string())
        .bind(&job.variants)
        .bind(job.state.as_str())
        .bind(job.progress_secs)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_asset(&self, id: Uuid) -> Result<Option<Asset>, StoreError> {
        sqlx::query_as::<_, AssetRow>("SELECT * FROM assets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Asset::try_from)
            .transpose()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn set_asset_state(&self, id: Uuid, state: AssetState) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE assets SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn add_uploaded_variant(&self, id: Uuid, variant: &str) -> Result<Asset, StoreError> {
        sqlx::query(
            r#"
            UPDATE assets
            SET uploaded_variants = array_append(uploaded_variants, $2), updated_at = NOW()
            WHERE id = $1 AND $2 = ANY(variants) AND NOT ($2 = ANY(uploaded_variants))
            "#,
        )
        .bind(id)
        .bind(variant)
        .execute(&self.pool)
        .await?;

        self.get_asset(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn set_job_state(
        &self,
        id: Uuid,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = $2, error = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn raise_job_progress(&self, id: Uuid, position_secs: f64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs SET progress_secs = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'encoding' AND progress_secs < $2
            "#,
        )
        .bind(id)
        .bind(position_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
