//! Image metadata entity and the aggregation shapes served by the query API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One discovered post: metadata first, binary artifact later.
///
/// `(source_id, id)` is unique across the catalogue. `local_path` is relative
/// to the configured image directory; `None` (or empty) means the binary has
/// not been downloaded yet, or went dangling and is queued for re-download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMeta {
    pub id: String,
    pub source_id: String,
    pub tags: Vec<String>,
    pub image_url: String,
    pub local_path: Option<String>,
    pub post_time: DateTime<Utc>,
}

impl ImageMeta {
    /// Hex md5 of `"{source_id}-{id}"`. Stable across runs; the download
    /// pipeline derives file names and shard directories from it.
    pub fn hash(&self) -> String {
        format!("{:x}", md5::compute(format!("{}-{}", self.source_id, self.id)))
    }

    /// Three-level shard directory from the first six hex chars of the hash:
    /// `ab/cd/ef`.
    pub fn shard_dir(hash: &str) -> String {
        format!("{}/{}/{}", &hash[0..2], &hash[2..4], &hash[4..6])
    }

    /// True when a local artifact has been committed for this row.
    pub fn has_local_path(&self) -> bool {
        self.local_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Per-tag aggregate with an optional cover image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagInfo {
    pub tag: String,
    pub count: i64,
    pub cover: Option<ImageMeta>,
}

/// One page of tag aggregates plus the unpaginated total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagList {
    pub tag_list: Vec<TagInfo>,
    pub total_count: i64,
}

/// One page of downloaded images plus the unpaginated total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageList {
    pub image_list: Vec<ImageMeta>,
    pub total_count: i64,
}
