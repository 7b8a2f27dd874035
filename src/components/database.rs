//! Typed operations over the partitioned `images` and `tags` tables.
//!
//! Both tables are LIST-partitioned by source; `images` is additionally
//! RANGE-sub-partitioned by month of `post_time`. Source partitions are
//! created by `init_source`, monthly sub-partitions lazily when an insert
//! first hits a new month.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use once_cell::sync::OnceCell;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::{Application, Component, RegistryError, ServiceHandle};
use crate::domain::{ImageList, ImageMeta, TagInfo, TagList};

pub const COMPONENT_ID: &str = "db";
pub const SERVICE_ID: &str = "db";

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id text NOT NULL,
    source_id text NOT NULL,
    tags text[] NOT NULL DEFAULT '{}',
    image_url text NOT NULL,
    local_path text,
    post_time timestamptz NOT NULL,
    PRIMARY KEY (id, source_id, post_time)
) PARTITION BY LIST (source_id);

CREATE TABLE IF NOT EXISTS tags (
    tag text NOT NULL,
    source_id text NOT NULL,
    count integer NOT NULL DEFAULT 0,
    cover text,
    PRIMARY KEY (tag, source_id)
) PARTITION BY LIST (source_id);
"#;

const META_COLUMNS: &str = "id, source_id, tags, image_url, local_path, post_time";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database component not loaded")]
    NotLoaded,
    #[error("image {id} not found in source {source_id}")]
    NotFound { source_id: String, id: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub struct Database {
    pool: OnceCell<PgPool>,
}

impl Database {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { pool: OnceCell::new() })
    }

    fn pool(&self) -> Result<&PgPool, DbError> {
        self.pool.get().ok_or(DbError::NotLoaded)
    }

    /// Idempotently create the per-source partitions of both tables.
    pub async fn init_source(&self, source: &str) -> Result<(), DbError> {
        let pool = self.pool()?;
        let images = format!(
            "CREATE TABLE IF NOT EXISTS images_source_{source} PARTITION OF images \
             FOR VALUES IN ('{source}') PARTITION BY RANGE (post_time)"
        );
        sqlx::query(&images).execute(pool).await?;
        let tags = format!(
            "CREATE TABLE IF NOT EXISTS tags_source_{source} PARTITION OF tags \
             FOR VALUES IN ('{source}')"
        );
        sqlx::query(&tags).execute(pool).await?;
        info!(source, "source partitions ready");
        Ok(())
    }

    pub async fn get_meta(&self, id: &str, source: &str) -> Result<Option<ImageMeta>, DbError> {
        let pool = self.pool()?;
        let row = sqlx::query(&format!(
            "SELECT {META_COLUMNS} FROM images WHERE id = $1 AND source_id = $2"
        ))
        .bind(id)
        .bind(source)
        .fetch_optional(pool)
        .await?;
        row.map(|r| meta_from_row(&r)).transpose().map_err(Into::into)
    }

    /// Insert a newly discovered row. An insert failure is assumed to be a
    /// missing monthly sub-partition: create it and retry once. Successful
    /// inserts also bump the materialized per-tag counts.
    pub async fn insert_meta(&self, meta: &ImageMeta) -> Result<(), DbError> {
        let pool = self.pool()?;
        if let Err(err) = self.try_insert(meta).await {
            warn!(id = %meta.id, source = %meta.source_id, error = %err,
                "insert failed, creating monthly partition and retrying");
            let (name, begin, end) = month_partition(&meta.source_id, meta.post_time);
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF images_source_{} \
                 FOR VALUES FROM ('{begin}') TO ('{end}')",
                meta.source_id
            );
            sqlx::query(&sql).execute(pool).await?;
            self.try_insert(meta).await?;
        }
        for tag in &meta.tags {
            sqlx::query(
                "INSERT INTO tags (tag, source_id, count, cover) VALUES ($1, $2, 1, NULL) \
                 ON CONFLICT (tag, source_id) DO UPDATE SET count = tags.count + 1",
            )
            .bind(tag)
            .bind(&meta.source_id)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    async fn try_insert(&self, meta: &ImageMeta) -> Result<(), DbError> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO images (id, source_id, tags, image_url, local_path, post_time) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&meta.id)
        .bind(&meta.source_id)
        .bind(&meta.tags)
        .bind(&meta.image_url)
        .bind(&meta.local_path)
        .bind(meta.post_time)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Newest rows that still lack a local artifact.
    pub async fn get_meta_without_local_path(
        &self,
        source: &str,
        max: i64,
    ) -> Result<Vec<ImageMeta>, DbError> {
        let pool = self.pool()?;
        let rows = sqlx::query(&format!(
            "SELECT {META_COLUMNS} FROM images \
             WHERE source_id = $1 AND (local_path IS NULL OR local_path = '') \
             ORDER BY post_time DESC LIMIT $2"
        ))
        .bind(source)
        .bind(max)
        .fetch_all(pool)
        .await?;
        rows.iter().map(meta_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Commit (or clear) the row's local path. A non-empty path also claims
    /// the cover slot of any of the row's tags that still lack one.
    pub async fn update_local_path(&self, meta: &ImageMeta) -> Result<(), DbError> {
        let pool = self.pool()?;
        sqlx::query(
            "UPDATE images SET local_path = $1 \
             WHERE id = $2 AND source_id = $3 AND post_time = $4",
        )
        .bind(&meta.local_path)
        .bind(&meta.id)
        .bind(&meta.source_id)
        .bind(meta.post_time)
        .execute(pool)
        .await?;
        if meta.has_local_path() && !meta.tags.is_empty() {
            sqlx::query(
                "UPDATE tags SET cover = $1 \
                 WHERE source_id = $2 AND cover IS NULL AND tag = ANY($3)",
            )
            .bind(&meta.id)
            .bind(&meta.source_id)
            .bind(&meta.tags)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    /// Tag aggregates, excluding grouping pseudo-tags (`group_*`), covers
    /// hydrated from `images`.
    pub async fn list_not_group_tags(
        &self,
        source: &str,
        offset: i64,
        limit: i64,
    ) -> Result<TagList, DbError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT t.tag, t.count, \
                    i.id, i.source_id, i.tags, i.image_url, i.local_path, i.post_time \
             FROM tags t \
             LEFT JOIN images i ON i.source_id = t.source_id AND i.id = t.cover \
             WHERE t.source_id = $1 AND t.tag NOT LIKE 'group\\_%' \
             ORDER BY t.count DESC, t.tag ASC \
             OFFSET $2 LIMIT $3",
        )
        .bind(source)
        .bind(offset)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        let mut tag_list = Vec::with_capacity(rows.len());
        for row in &rows {
            let cover = match row.try_get::<Option<String>, _>("id")? {
                Some(_) => Some(meta_from_row(row)?),
                None => None,
            };
            tag_list.push(TagInfo {
                tag: row.try_get("tag")?,
                count: i64::from(row.try_get::<i32, _>("count")?),
                cover,
            });
        }
        let total_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM tags \
             WHERE source_id = $1 AND tag NOT LIKE 'group\\_%'",
        )
        .bind(source)
        .fetch_one(pool)
        .await?
        .try_get("n")?;
        Ok(TagList { tag_list, total_count })
    }

    /// Downloaded rows newest-first, optionally filtered to rows carrying
    /// every requested tag.
    pub async fn list_downloaded_images(
        &self,
        source: &str,
        tags: &[String],
        offset: i64,
        limit: i64,
    ) -> Result<ImageList, DbError> {
        let pool = self.pool()?;
        let tags = tags.to_vec();
        let rows = sqlx::query(&format!(
            "SELECT {META_COLUMNS} FROM images \
             WHERE source_id = $1 AND local_path IS NOT NULL AND local_path <> '' \
               AND tags @> $2 \
             ORDER BY post_time DESC OFFSET $3 LIMIT $4"
        ))
        .bind(source)
        .bind(&tags)
        .bind(offset)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        let image_list = rows
            .iter()
            .map(meta_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let total_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM images \
             WHERE source_id = $1 AND local_path IS NOT NULL AND local_path <> '' \
               AND tags @> $2",
        )
        .bind(source)
        .bind(&tags)
        .fetch_one(pool)
        .await?
        .try_get("n")?;
        Ok(ImageList { image_list, total_count })
    }

    /// Single-row lookup for the query API; unknown ids are a distinct error
    /// so the surface can answer 404.
    pub async fn get_image_meta(&self, source: &str, id: &str) -> Result<ImageMeta, DbError> {
        self.get_meta(id, source).await?.ok_or_else(|| DbError::NotFound {
            source_id: source.to_string(),
            id: id.to_string(),
        })
    }
}

fn meta_from_row(row: &PgRow) -> Result<ImageMeta, sqlx::Error> {
    Ok(ImageMeta {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        tags: row.try_get("tags")?,
        image_url: row.try_get("image_url")?,
        local_path: row.try_get("local_path")?,
        post_time: row.try_get("post_time")?,
    })
}

/// Name and UTC month bounds of the sub-partition covering `post_time`.
fn month_partition(source: &str, post_time: DateTime<Utc>) -> (String, String, String) {
    let (year, month) = (post_time.year(), post_time.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    (
        format!("images_source_{source}_{year:04}{month:02}"),
        format!("{year:04}-{month:02}-01"),
        format!("{next_year:04}-{next_month:02}-01"),
    )
}

#[async_trait]
impl Component for Database {
    fn id(&self) -> &'static str {
        COMPONENT_ID
    }

    fn name(&self) -> &'static str {
        "database"
    }

    async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()> {
        let connection = &app.config().database.connection;
        let pool = PgPool::connect(connection).await?;
        sqlx::raw_sql(INIT_SQL).execute(&pool).await?;
        info!("database schema ready");
        self.pool.set(pool).map_err(|_| anyhow::anyhow!("database already loaded"))?;
        Ok(())
    }

    async fn unload(self: Arc<Self>) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    fn service(self: Arc<Self>, service_id: &str) -> Result<ServiceHandle, RegistryError> {
        if service_id == SERVICE_ID {
            Ok(self)
        } else {
            Err(RegistryError::UnknownService {
                component: COMPONENT_ID.to_string(),
                service: service_id.to_string(),
            })
        }
    }
}
