use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Row, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatastreamRow {
    pub id: i64,
    pub name: String,
    pub thing_id: Option<i64>,
    pub observed_property_id: Option<i64>,
    pub sensor_id: Option<i64>,
    pub unit_name: Option<String>,
    pub unit_symbol: Option<String>,
    pub phenomenon_time_start: Option<String>,
    pub phenomenon_time_end: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub encoding_type: Option<String>,
    pub feature: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRow {
    pub id: i64,
    pub datastream_id: i64,
    /// Raw phenomenon time start as delivered upstream.
    pub phenomenon_time: String,
    pub phenomenon_time_end: Option<String>,
    /// Normalized whole-second UTC start; watermark queries run over this.
    pub phenomenon_unix: i64,
    pub result_time: Option<String>,
    pub result: Option<String>,
    pub result_quality: Option<String>,
    pub parameters: Option<String>,
    pub feature_id: i64,
}

#[derive(Clone)]
pub struct SensorStore {
    pool: SqlitePool,
}

impl SensorStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::new_at(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Metadata refresh: a re-fetched datastream overwrites the stored row,
    /// except that a missing thing id never clobbers a known one.
    pub async fn upsert_datastream(&self, row: &DatastreamRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO datastreams (
                id, name, thing_id, observed_property_id, sensor_id,
                unit_name, unit_symbol, phenomenon_time_start, phenomenon_time_end
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                thing_id = COALESCE(excluded.thing_id, datastreams.thing_id),
                observed_property_id = excluded.observed_property_id,
                sensor_id = excluded.sensor_id,
                unit_name = excluded.unit_name,
                unit_symbol = excluded.unit_symbol,
                phenomenon_time_start = excluded.phenomenon_time_start,
                phenomenon_time_end = excluded.phenomenon_time_end",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.thing_id)
        .bind(row.observed_property_id)
        .bind(row.sensor_id)
        .bind(&row.unit_name)
        .bind(&row.unit_symbol)
        .bind(&row.phenomenon_time_start)
        .bind(&row.phenomenon_time_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_datastream(&self, id: i64) -> Result<Option<DatastreamRow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, thing_id, observed_property_id, sensor_id,
                    unit_name, unit_symbol, phenomenon_time_start, phenomenon_time_end
             FROM datastreams WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(DatastreamRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            thing_id: row.try_get("thing_id")?,
            observed_property_id: row.try_get("observed_property_id")?,
            sensor_id: row.try_get("sensor_id")?,
            unit_name: row.try_get("unit_name")?,
            unit_symbol: row.try_get("unit_symbol")?,
            phenomenon_time_start: row.try_get("phenomenon_time_start")?,
            phenomenon_time_end: row.try_get("phenomenon_time_end")?,
        }))
    }

    /// One transaction per batch: features first so the observation foreign
    /// keys resolve, both sides insert-if-absent. Returns the number of
    /// observation rows actually inserted; re-supplied ids count zero.
    pub async fn write_batch(
        &self,
        features: &[FeatureRow],
        observations: &[ObservationRow],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        for feature in features {
            sqlx::query(
                "INSERT INTO features_of_interest (id, name, description, encoding_type, feature)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(feature.id)
            .bind(&feature.name)
            .bind(&feature.description)
            .bind(&feature.encoding_type)
            .bind(&feature.feature)
            .execute(&mut *tx)
            .await?;
        }

        let mut written = 0u64;
        for obs in observations {
            let result = sqlx::query(
                "INSERT INTO observations (
                    id, datastream_id, phenomenon_time, phenomenon_time_end,
                    phenomenon_unix, result_time, result, result_quality,
                    parameters, feature_id
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO NOTHING",
            )
            .bind(obs.id)
            .bind(obs.datastream_id)
            .bind(&obs.phenomenon_time)
            .bind(&obs.phenomenon_time_end)
            .bind(obs.phenomenon_unix)
            .bind(&obs.result_time)
            .bind(&obs.result)
            .bind(&obs.result_quality)
            .bind(&obs.parameters)
            .bind(obs.feature_id)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    /// `None` means no rows yet, which is not the same thing as zero.
    pub async fn latest_observed(&self, datastream_id: i64) -> Result<Option<i64>, StoreError> {
        let row =
            sqlx::query("SELECT MAX(phenomenon_unix) AS at FROM observations WHERE datastream_id = ?1")
                .bind(datastream_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("at")?)
    }

    pub async fn earliest_observed(&self, datastream_id: i64) -> Result<Option<i64>, StoreError> {
        let row =
            sqlx::query("SELECT MIN(phenomenon_unix) AS at FROM observations WHERE datastream_id = ?1")
                .bind(datastream_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("at")?)
    }

    pub async fn observation_count(&self, datastream_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM observations WHERE datastream_id = ?1")
            .bind(datastream_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(data_dir.join("sealevel-sync").join("sea_level_data.db"))
}
