use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::settings::{PlantSettings, Settings};
use crate::telemetry::{now_unix_secs, Reading};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    ts: f64,
    soil_1: i64,
    soil_2: i64,
    soil_3: i64,
    soil_avg: i64,
    temperature: f64,
    humidity: f64,
    water_level: bool,
    fan_status: bool,
    heater_status: bool,
}

impl From<ReadingRow> for Reading {
    fn from(r: ReadingRow) -> Self {
        Reading {
            timestamp: r.ts,
            soil_1: r.soil_1,
            soil_2: r.soil_2,
            soil_3: r.soil_3,
            soil_avg: r.soil_avg,
            temperature: r.temperature,
            humidity: r.humidity,
            water_level: r.water_level,
            fan_status: r.fan_status,
            heater_status: r.heater_status,
        }
    }
}

const READING_COLUMNS: &str = "ts, soil_1, soil_2, soil_3, soil_avg, \
     temperature, humidity, water_level, fan_status, heater_status";

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plant/plant.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" is its own database; keep exactly one
        // alive for the life of the pool.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &Reading) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO readings ({READING_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(r.timestamp)
        .bind(r.soil_1)
        .bind(r.soil_2)
        .bind(r.soil_3)
        .bind(r.soil_avg)
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.water_level)
        .bind(r.fan_status)
        .bind(r.heater_status)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest reading by timestamp; insertion order breaks ties.
    pub async fn latest_reading(&self) -> Result<Option<Reading>> {
        let row: Option<ReadingRow> = sqlx::query_as(&format!(
            "SELECT {READING_COLUMNS} FROM readings ORDER BY ts DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")?;

        Ok(row.map(Reading::from))
    }

    /// The last `limit` readings, oldest first.
    pub async fn recent_readings(&self, limit: u32) -> Result<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS} FROM (
              SELECT id, {READING_COLUMNS}
              FROM readings
              ORDER BY ts DESC, id DESC
              LIMIT ?
            )
            ORDER BY ts ASC, id ASC
            "#
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;

        Ok(rows.into_iter().map(Reading::from).collect())
    }

    // ----------------------------
    // Settings
    // ----------------------------

    pub async fn get_setting(&self, key: &str, default: &str) -> Result<String> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context("get_setting failed")?;

        Ok(value.unwrap_or_else(|| default.to_string()))
    }

    pub async fn get_all_settings(&self) -> Result<Settings> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, value FROM settings ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .context("get_all_settings failed")?;

        Ok(rows.into_iter().collect())
    }

    /// Upsert every pair in one transaction: either all land or none do.
    pub async fn update_settings(&self, updates: &[(&str, &str)]) -> Result<()> {
        let now = now_unix_secs();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("update_settings: begin failed")?;

        for (key, value) in updates {
            sqlx::query(
                r#"
                INSERT INTO settings (name, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                  value=excluded.value,
                  updated_at=excluded.updated_at
                "#,
            )
            .bind(*key)
            .bind(*value)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("update_settings failed for {key}"))?;
        }

        tx.commit().await.context("update_settings: commit failed")?;
        Ok(())
    }

    /// Insert any missing setting with its default. Existing values are left
    /// alone. Returns how many rows were added.
    pub async fn seed_settings(&self, defaults: &PlantSettings) -> Result<usize> {
        let now = now_unix_secs();
        let mut tx = self.pool.begin().await.context("seed_settings: begin failed")?;
        let mut inserted = 0;

        for (key, value) in defaults.to_pairs() {
            let done = sqlx::query(
                r#"
                INSERT INTO settings (name, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(name) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("seed_settings failed")?;
            inserted += done.rows_affected() as usize;
        }

        tx.commit().await.context("seed_settings: commit failed")?;
        Ok(inserted)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
