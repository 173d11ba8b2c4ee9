//! Durable listing + score stores (SQLite) and HTTP fetch utilities for Last Bottle Watch.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lbw_core::{Listing, ListingId, ListingKey, Outcome, ScoreRecord, StoredListing};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

mod http;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "lbw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("preparing database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Previously seen listings, keyed by [`ListingKey`].
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn has_seen(&self, key: &ListingKey) -> Result<bool, StoreError>;

    /// Persist a listing; recording a known key returns the existing id untouched.
    async fn record(&self, listing: &Listing) -> Result<ListingId, StoreError>;
}

/// Per-user, per-listing outcomes. At most one record per pair.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn score_record(
        &self,
        user_id: &str,
        listing_id: ListingId,
    ) -> Result<Option<ScoreRecord>, StoreError>;

    async fn has_scored(&self, user_id: &str, listing_id: ListingId) -> Result<bool, StoreError> {
        Ok(self.score_record(user_id, listing_id).await?.is_some())
    }

    /// Fails with [`StoreError::ConstraintViolation`] when the pair already has a record.
    async fn record_outcome(
        &self,
        user_id: &str,
        listing_id: ListingId,
        score: Option<u8>,
        outcome: Outcome,
    ) -> Result<ScoreRecord, StoreError>;

    /// Delivery-status transition for a record currently in `notify_pending`.
    async fn update_delivery(
        &self,
        user_id: &str,
        listing_id: ListingId,
        outcome: Outcome,
        notify_attempts: u32,
    ) -> Result<ScoreRecord, StoreError>;
}

/// Listing plus aggregate scoring stats, for history views.
#[derive(Debug, Clone, Serialize)]
pub struct ListingSummary {
    pub listing: StoredListing,
    pub average_score: Option<f64>,
    pub evaluations: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserScoreRow {
    pub record: ScoreRecord,
    pub wine_name: String,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct WineDatabase {
    pool: SqlitePool,
}

impl WineDatabase {
    /// Open (creating if missing) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        if let Some(parent) = sqlite_file_path(database_url)
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(database_url, "wine database ready");
        Ok(db)
    }

    /// Private in-memory database; one pinned connection so the data survives.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_listing(&self, id: ListingId) -> Result<Option<StoredListing>, StoreError> {
        sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| listing_from_row(&row))
            .transpose()
    }

    pub async fn latest_listing(&self) -> Result<Option<StoredListing>, StoreError> {
        sqlx::query("SELECT * FROM listings ORDER BY first_seen_at DESC, id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .map(|row| listing_from_row(&row))
            .transpose()
    }

    pub async fn recent_listings(&self, limit: u32) -> Result<Vec<ListingSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT l.*, AVG(s.score) AS average_score, COUNT(s.id) AS evaluations
            FROM listings l
            LEFT JOIN score_records s ON s.listing_id = l.id
            GROUP BY l.id
            ORDER BY l.first_seen_at DESC, l.id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ListingSummary {
                    listing: listing_from_row(row)?,
                    average_score: row.try_get("average_score")?,
                    evaluations: row.try_get("evaluations")?,
                })
            })
            .collect()
    }

    pub async fn scores_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<UserScoreRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.*, l.wine_name, l.price
            FROM score_records s
            JOIN listings l ON l.id = s.listing_id
            WHERE s.user_id = ?
            ORDER BY s.created_at DESC, s.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UserScoreRow {
                    record: score_from_row(row)?,
                    wine_name: row.try_get("wine_name")?,
                    price: row.try_get("price")?,
                })
            })
            .collect()
    }

    pub async fn scores_for_listing(
        &self,
        listing_id: ListingId,
    ) -> Result<Vec<ScoreRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM score_records WHERE listing_id = ? ORDER BY user_id")
            .bind(listing_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(score_from_row).collect()
    }
}

#[async_trait]
impl ListingStore for WineDatabase {
    async fn has_seen(&self, key: &ListingKey) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM listings WHERE listing_key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record(&self, listing: &Listing) -> Result<ListingId, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO listings (listing_key, wine_name, price, wine_type, url, scraped_at, first_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (listing_key) DO NOTHING
            "#,
        )
        .bind(listing.key.as_str())
        .bind(&listing.wine_name)
        .bind(listing.price)
        .bind(listing.wine_type.as_deref())
        .bind(&listing.url)
        .bind(listing.scraped_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let id: i64 = sqlx::query_scalar("SELECT id FROM listings WHERE listing_key = ?")
            .bind(listing.key.as_str())
            .fetch_one(&self.pool)
            .await?;
        debug!(listing_key = %listing.key, id, new = inserted > 0, "recorded listing");
        Ok(ListingId(id))
    }
}

#[async_trait]
impl ScoreStore for WineDatabase {
    async fn score_record(
        &self,
        user_id: &str,
        listing_id: ListingId,
    ) -> Result<Option<ScoreRecord>, StoreError> {
        sqlx::query("SELECT * FROM score_records WHERE user_id = ? AND listing_id = ?")
            .bind(user_id)
            .bind(listing_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| score_from_row(&row))
            .transpose()
    }

    async fn record_outcome(
        &self,
        user_id: &str,
        listing_id: ListingId,
        score: Option<u8>,
        outcome: Outcome,
    ) -> Result<ScoreRecord, StoreError> {
        if score.is_some_and(|s| s > 100) {
            return Err(StoreError::ConstraintViolation(format!(
                "score {score:?} outside 0..=100 for user {user_id}"
            )));
        }
        let notify_attempts = match outcome {
            Outcome::Notified | Outcome::NotifyPending | Outcome::NotifyAbandoned => 1,
            _ => 0,
        };
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO score_records (user_id, listing_id, score, outcome, notify_attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(listing_id.0)
        .bind(score.map(i64::from))
        .bind(outcome.as_str())
        .bind(i64::from(notify_attempts))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(ScoreRecord {
                user_id: user_id.to_string(),
                listing_id,
                score,
                outcome,
                notify_attempts,
                created_at: now,
                updated_at: now,
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::ConstraintViolation(format!(
                    "user {user_id} already has an outcome for listing {listing_id}"
                )))
            }
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(StoreError::ConstraintViolation(format!(
                    "listing {listing_id} does not exist"
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_delivery(
        &self,
        user_id: &str,
        listing_id: ListingId,
        outcome: Outcome,
        notify_attempts: u32,
    ) -> Result<ScoreRecord, StoreError> {
        if !matches!(
            outcome,
            Outcome::Notified | Outcome::NotifyPending | Outcome::NotifyAbandoned
        ) {
            return Err(StoreError::ConstraintViolation(format!(
                "{outcome} is not a delivery status"
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE score_records
            SET outcome = ?, notify_attempts = ?, updated_at = ?
            WHERE user_id = ? AND listing_id = ? AND outcome = ?
            "#,
        )
        .bind(outcome.as_str())
        .bind(i64::from(notify_attempts))
        .bind(Utc::now())
        .bind(user_id)
        .bind(listing_id.0)
        .bind(Outcome::NotifyPending.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let record = self.score_record(user_id, listing_id).await?.ok_or_else(|| {
            StoreError::NotFound(format!("no outcome for user {user_id} on listing {listing_id}"))
        })?;
        if updated == 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "outcome for user {user_id} on listing {listing_id} is {}, not pending delivery",
                record.outcome
            )));
        }
        Ok(record)
    }
}

/// Filesystem path behind a `sqlite:` url, if it names a file.
fn sqlite_file_path(database_url: &str) -> Option<std::path::PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(std::path::PathBuf::from(path))
}

fn listing_from_row(row: &SqliteRow) -> Result<StoredListing, StoreError> {
    Ok(StoredListing {
        id: ListingId(row.try_get("id")?),
        first_seen_at: row.try_get::<DateTime<Utc>, _>("first_seen_at")?,
        listing: Listing {
            key: ListingKey::from_stored(row.try_get::<String, _>("listing_key")?),
            wine_name: row.try_get("wine_name")?,
            price: row.try_get("price")?,
            wine_type: row.try_get("wine_type")?,
            url: row.try_get("url")?,
            scraped_at: row.try_get("scraped_at")?,
        },
    })
}

fn score_from_row(row: &SqliteRow) -> Result<ScoreRecord, StoreError> {
    let outcome: String = row.try_get("outcome")?;
    let score: Option<i64> = row.try_get("score")?;
    let attempts: i64 = row.try_get("notify_attempts")?;
    Ok(ScoreRecord {
        user_id: row.try_get("user_id")?,
        listing_id: ListingId(row.try_get("listing_id")?),
        score: score
            .map(u8::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt(format!("score {score:?} out of range")))?,
        outcome: outcome
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        notify_attempts: u32::try_from(attempts)
            .map_err(|_| StoreError::Corrupt(format!("notify_attempts {attempts}")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
