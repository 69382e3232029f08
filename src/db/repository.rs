use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{FeedId, HashType, Header, MediaHash, Subscription, SubscriptionValue};

use super::schema::SCHEMA;
use super::store::{HashStore, Storage};

const SUBSCRIPTION_COLUMNS: &str = "feed_id, vendor, sub_id, name, data, updated_at, error";

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn list_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let subs = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY feed_id, vendor, sub_id"
                ))?;
                let subs = stmt
                    .query_map([], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(subs)
            })
            .await?;
        Ok(subs)
    }
}

#[async_trait]
impl Storage for Repository {
    async fn active_feed_ids(&self) -> Result<Vec<FeedId>> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT feed_id FROM subscriptions WHERE error IS NULL ORDER BY feed_id",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<FeedId>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn create_subscription(&self, sub: &Subscription) -> Result<()> {
        let sub = sub.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let inserted = conn.execute(
                    r#"INSERT INTO subscriptions (feed_id, vendor, sub_id, name, data, updated_at, error)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                       ON CONFLICT(feed_id, vendor, sub_id) DO NOTHING"#,
                    params![
                        sub.header.feed_id,
                        sub.header.vendor,
                        sub.header.sub_id,
                        sub.name,
                        sub.data,
                        sub.updated_at.map(format_datetime),
                        sub.error,
                    ],
                )?;
                Ok(inserted)
            })
            .await?;

        if inserted == 0 {
            return Err(AppError::Exists);
        }
        Ok(())
    }

    async fn get_subscription(&self, header: &Header) -> Result<Subscription> {
        let header = header.clone();
        let sub = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE feed_id = ?1 AND vendor = ?2 AND sub_id = ?3"
                ))?;
                let sub = stmt
                    .query_row(
                        params![header.feed_id, header.vendor, header.sub_id],
                        subscription_from_row,
                    )
                    .optional()?;
                Ok(sub)
            })
            .await?;
        sub.ok_or(AppError::NotFound)
    }

    async fn shift_subscription(&self, feed_id: FeedId) -> Result<Subscription> {
        let sub = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                       WHERE feed_id = ?1 AND error IS NULL
                       ORDER BY updated_at ASC NULLS FIRST, created_at ASC
                       LIMIT 1"#
                ))?;
                let sub = stmt
                    .query_row(params![feed_id], subscription_from_row)
                    .optional()?;
                Ok(sub)
            })
            .await?;
        sub.ok_or(AppError::NotFound)
    }

    async fn list_subscriptions(&self, feed_id: FeedId, active: bool) -> Result<Vec<Subscription>> {
        let subs = self
            .conn
            .call(move |conn| {
                let filter = if active {
                    "error IS NULL"
                } else {
                    "error IS NOT NULL"
                };
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE feed_id = ?1 AND {filter} ORDER BY name"
                ))?;
                let subs = stmt
                    .query_map(params![feed_id], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(subs)
            })
            .await?;
        Ok(subs)
    }

    async fn update_subscription(&self, header: &Header, value: SubscriptionValue) -> Result<()> {
        let header = header.clone();
        let now = format_datetime(Utc::now());
        let updated = self
            .conn
            .call(move |conn| {
                let updated = match value {
                    SubscriptionValue::Resume => conn.execute(
                        r#"UPDATE subscriptions SET error = NULL
                           WHERE feed_id = ?1 AND vendor = ?2 AND sub_id = ?3 AND error IS NOT NULL"#,
                        params![header.feed_id, header.vendor, header.sub_id],
                    )?,
                    SubscriptionValue::Data(data) => conn.execute(
                        r#"UPDATE subscriptions SET data = ?4, updated_at = ?5
                           WHERE feed_id = ?1 AND vendor = ?2 AND sub_id = ?3 AND error IS NULL"#,
                        params![header.feed_id, header.vendor, header.sub_id, data, now],
                    )?,
                    SubscriptionValue::Error(reason) => conn.execute(
                        r#"UPDATE subscriptions SET error = ?4, updated_at = ?5
                           WHERE feed_id = ?1 AND vendor = ?2 AND sub_id = ?3 AND error IS NULL"#,
                        params![header.feed_id, header.vendor, header.sub_id, reason, now],
                    )?,
                };
                Ok(updated)
            })
            .await?;

        if updated == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn delete_subscription(&self, header: &Header) -> Result<()> {
        let header = header.clone();
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM subscriptions WHERE feed_id = ?1 AND vendor = ?2 AND sub_id = ?3",
                    params![header.feed_id, header.vendor, header.sub_id],
                )?;
                Ok(deleted)
            })
            .await?;

        if deleted == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn delete_all_subscriptions(&self, feed_id: FeedId, pattern: &str) -> Result<u64> {
        let pattern = pattern.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM subscriptions WHERE feed_id = ?1 AND error LIKE ?2",
                    params![feed_id, pattern],
                )?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted as u64)
    }
}

#[async_trait]
impl HashStore for Repository {
    async fn check_unique(&self, hash: &MediaHash) -> Result<MediaHash> {
        let hash = hash.clone();
        let stored = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"INSERT INTO media_hashes (feed_id, url, hash_type, hash_value, first_seen, last_seen, collisions)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                       ON CONFLICT(feed_id, hash_type, hash_value) DO UPDATE SET
                           collisions = collisions + 1,
                           last_seen = excluded.last_seen,
                           url = excluded.url"#,
                    params![
                        hash.feed_id,
                        hash.url,
                        hash.hash_type.as_str(),
                        hash.hash_value,
                        format_datetime(hash.first_seen),
                        format_datetime(hash.last_seen),
                    ],
                )?;
                let stored = tx.query_row(
                    r#"SELECT feed_id, url, hash_type, hash_value, first_seen, last_seen, collisions
                       FROM media_hashes WHERE feed_id = ?1 AND hash_type = ?2 AND hash_value = ?3"#,
                    params![hash.feed_id, hash.hash_type.as_str(), hash.hash_value],
                    media_hash_from_row,
                )?;
                tx.commit()?;
                Ok(stored)
            })
            .await?;
        Ok(stored)
    }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56.000000Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        header: Header {
            feed_id: row.get(0)?,
            vendor: row.get(1)?,
            sub_id: row.get(2)?,
        },
        name: row.get(3)?,
        data: row.get(4)?,
        updated_at: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| parse_datetime(&s)),
        error: row.get(6)?,
    })
}

fn media_hash_from_row(row: &Row) -> rusqlite::Result<MediaHash> {
    let hash_type: String = row.get(2)?;
    let hash_type = HashType::parse(&hash_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown hash type {hash_type}").into(),
        )
    })?;
    Ok(MediaHash {
        feed_id: row.get(0)?,
        url: row.get(1)?,
        hash_type,
        hash_value: row.get(3)?,
        first_seen: datetime_column(row, 4)?,
        last_seen: datetime_column(row, 5)?,
        collisions: row.get(6)?,
    })
}

fn datetime_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_datetime(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unparsable timestamp {raw}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(feed_id: FeedId, sub_id: &str) -> Subscription {
        Subscription {
            header: Header::new(feed_id, "rss", sub_id),
            name: sub_id.to_uppercase(),
            data: "{}".to_string(),
            updated_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_header() {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.create_subscription(&sub(1, "a")).await.unwrap();

        let err = repo.create_subscription(&sub(1, "a")).await.unwrap_err();
        assert!(matches!(err, AppError::Exists));

        // same sub_id on another destination is a different header
        repo.create_subscription(&sub(2, "a")).await.unwrap();
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let repo = Repository::open_in_memory().await.unwrap();
        let err = repo
            .get_subscription(&Header::new(1, "rss", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn shift_serves_oldest_active_first() {
        let repo = Repository::open_in_memory().await.unwrap();
        for id in ["a", "b", "c"] {
            repo.create_subscription(&sub(1, id)).await.unwrap();
        }
        repo.update_subscription(&Header::new(1, "rss", "a"), SubscriptionValue::Data("1".into()))
            .await
            .unwrap();
        repo.update_subscription(&Header::new(1, "rss", "b"), SubscriptionValue::Error("boom".into()))
            .await
            .unwrap();

        // "c" was never touched, "b" is suspended
        let next = repo.shift_subscription(1).await.unwrap();
        assert_eq!(next.header.sub_id, "c");

        repo.update_subscription(&next.header, SubscriptionValue::Data("2".into()))
            .await
            .unwrap();
        let next = repo.shift_subscription(1).await.unwrap();
        assert_eq!(next.header.sub_id, "a");
        assert_eq!(next.data, "1");

        let err = repo.shift_subscription(9).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn guarded_updates_report_state_mismatch() {
        let repo = Repository::open_in_memory().await.unwrap();
        let s = sub(1, "a");
        repo.create_subscription(&s).await.unwrap();

        let err = repo
            .update_subscription(&s.header, SubscriptionValue::Resume)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));

        repo.update_subscription(&s.header, SubscriptionValue::Error("e".into()))
            .await
            .unwrap();
        let err = repo
            .update_subscription(&s.header, SubscriptionValue::Error("again".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
        let err = repo
            .update_subscription(&s.header, SubscriptionValue::Data("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));

        let stored = repo.get_subscription(&s.header).await.unwrap();
        assert_eq!(stored.error.as_deref(), Some("e"));
        assert_eq!(stored.data, "{}");

        repo.update_subscription(&s.header, SubscriptionValue::Resume)
            .await
            .unwrap();
        assert!(repo.get_subscription(&s.header).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn listing_and_bulk_delete_by_reason() {
        let repo = Repository::open_in_memory().await.unwrap();
        for id in ["a", "b", "c", "d"] {
            repo.create_subscription(&sub(1, id)).await.unwrap();
        }
        repo.create_subscription(&sub(2, "z")).await.unwrap();
        for (id, reason) in [("a", "HTTP 404 gone"), ("b", "HTTP 410 gone"), ("c", "parse failed")] {
            repo.update_subscription(&Header::new(1, "rss", id), SubscriptionValue::Error(reason.into()))
                .await
                .unwrap();
        }

        assert_eq!(repo.list_subscriptions(1, true).await.unwrap().len(), 1);
        assert_eq!(repo.list_subscriptions(1, false).await.unwrap().len(), 3);
        assert_eq!(repo.active_feed_ids().await.unwrap(), vec![1, 2]);

        let deleted = repo.delete_all_subscriptions(1, "HTTP%").await.unwrap();
        assert_eq!(deleted, 2);
        let deleted = repo.delete_all_subscriptions(1, "%").await.unwrap();
        assert_eq!(deleted, 1);
        // active subscriptions never match a reason pattern
        assert_eq!(repo.list_subscriptions(1, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let repo = Repository::open_in_memory().await.unwrap();
        let s = sub(1, "a");
        repo.create_subscription(&s).await.unwrap();
        repo.delete_subscription(&s.header).await.unwrap();
        let err = repo.delete_subscription(&s.header).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn check_unique_counts_collisions() {
        let repo = Repository::open_in_memory().await.unwrap();
        let hash = MediaHash::new(1, "https://a/1.jpg", HashType::DHash, "00ff00ff00ff00ff".into());

        let first = repo.check_unique(&hash).await.unwrap();
        assert!(first.is_unique());
        assert_eq!(first.collisions, 0);

        let mut again = MediaHash::new(1, "https://b/2.jpg", HashType::DHash, "00ff00ff00ff00ff".into());
        again.last_seen = first.last_seen + chrono::Duration::seconds(5);
        let second = repo.check_unique(&again).await.unwrap();
        assert!(!second.is_unique());
        assert_eq!(second.collisions, 1);
        assert_eq!(second.url, "https://b/2.jpg");
        assert_eq!(second.first_seen, first.first_seen);

        // other destinations and hash types are independent
        let other_feed = MediaHash::new(2, "https://a/1.jpg", HashType::DHash, "00ff00ff00ff00ff".into());
        assert!(repo.check_unique(&other_feed).await.unwrap().is_unique());
        let other_type = MediaHash::new(1, "https://a/1.jpg", HashType::Sha256, "00ff00ff00ff00ff".into());
        assert!(repo.check_unique(&other_type).await.unwrap().is_unique());
    }

    #[tokio::test]
    async fn corrupt_hash_timestamp_is_an_error() {
        let repo = Repository::open_in_memory().await.unwrap();
        repo.conn
            .call(|conn| {
                conn.execute(
                    r#"INSERT INTO media_hashes (feed_id, url, hash_type, hash_value, first_seen, last_seen, collisions)
                       VALUES (1, 'https://a/1.jpg', 'dhash', 'ab', 'yesterday-ish', 'yesterday-ish', 0)"#,
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let hash = MediaHash::new(1, "https://b/2.jpg", HashType::DHash, "ab".into());
        let err = repo.check_unique(&hash).await.unwrap_err();
        assert!(err.to_string().contains("unparsable timestamp yesterday-ish"), "{err}");
    }
}
