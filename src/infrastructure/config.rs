//! Main application configuration, loaded once at startup from YAML.
//!
//! Keys are camelCase on disk. The `spiders` section is a map keyed by source
//! id; the key is injected into each [`SpiderConfig`] after decoding so the
//! rest of the system never has to carry the map key around separately.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Placeholder substituted with the page number in list URL templates.
pub const PAGE_PLACEHOLDER: &str = "__PAGE__";
/// Placeholder substituted with the post id in meta URL templates.
pub const ID_PLACEHOLDER: &str = "__ID__";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub spiders: HashMap<String, SpiderConfig>,
    pub image_converter: ImageConvertConfig,
    pub logger: LoggerConfig,
    pub image_dir: PathBuf,
    pub work_dir: PathBuf,
    pub database: DatabaseConfig,
    pub plugins: Vec<String>,
    pub api: ApiConfig,
    pub data_checker: DataCheckerConfig,
}

impl AppConfig {
    /// Read and validate the main config. Any failure here is fatal for the
    /// process; the caller exits with a diagnostic.
    pub fn load(path: &Path) -> Result<Self> {
        let reader = File::open(path)
            .with_context(|| format!("open config file {}", path.display()))?;
        let mut config: AppConfig = serde_yaml::from_reader(reader)
            .with_context(|| format!("decode config file {}", path.display()))?;
        for (id, spider) in &mut config.spiders {
            spider.id = id.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.spiders.is_empty() {
            bail!("no spiders configured");
        }
        for (id, spider) in &self.spiders {
            if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                bail!("source id {id:?} must match [A-Za-z0-9_]+ (it names table partitions)");
            }
            if !spider.list_parser.url_template.contains(PAGE_PLACEHOLDER) {
                bail!("spider {id}: listParser.urlTemplate must contain {PAGE_PLACEHOLDER}");
            }
            if !spider.meta_parser.url_template.contains(ID_PLACEHOLDER) {
                bail!("spider {id}: metaParser.urlTemplate must contain {ID_PLACEHOLDER}");
            }
            if !spider.meta_parser.post_time.ext.contains_key("format") {
                bail!("spider {id}: metaParser.postTime needs ext.format (time parse pattern)");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpiderConfig {
    /// Injected from the `spiders` map key, never read from the body.
    #[serde(default, skip_deserializing)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub meta_downloader: MetaDownloaderConfig,
    pub list_parser: ListParserConfig,
    pub meta_parser: MetaParserConfig,
    pub image_downloader: ImageDownloaderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaDownloaderConfig {
    /// Seconds to sleep between failed page/meta requests.
    #[serde(default)]
    pub error_retry_interval: u64,
    #[serde(default)]
    pub error_retry_max_count: u32,
    /// Seconds to wait after a full crawl before restarting from page one.
    #[serde(default)]
    pub refresh_interval: u64,
    #[serde(default)]
    pub connect_timeout: u64,
    /// Consecutive already-known ids tolerated before the new-data window is
    /// declared exhausted.
    #[serde(default, rename = "sameIDTolerance")]
    pub same_id_tolerance: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParserConfig {
    pub url_template: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub id: ParserConfig,
    pub page_num: ParserConfig,
    pub next_page: ParserConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaParserConfig {
    pub url_template: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<ParserConfig>,
    #[serde(rename = "imageURL")]
    pub image_url: ParserConfig,
    pub post_time: ParserConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDownloaderConfig {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub error_retry_interval: u64,
    #[serde(default)]
    pub error_retry_max_count: u32,
    #[serde(default)]
    pub connect_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConvertConfig {
    pub quality: u32,
    #[serde(default)]
    pub lossless_mode_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    /// trace | debug | info | warn | error. `RUST_LOG` still overrides.
    pub level: String,
    pub file: LogFileConfig,
    #[serde(default)]
    pub console: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFileConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub max_log_file_count: usize,
    /// Megabytes before the file is rotated.
    #[serde(default)]
    pub max_log_file_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub connection: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCheckerConfig {
    /// Seconds between verification batches.
    #[serde(default)]
    pub interval: u64,
    #[serde(default = "default_checker_batch")]
    pub batch_size: i64,
    /// Seconds to idle after a clean full scan.
    #[serde(default = "default_checker_restart")]
    pub restart_interval: u64,
}

fn default_checker_batch() -> i64 {
    100
}

fn default_checker_restart() -> u64 {
    5 * 60 * 60
}

/// Which piece of a matched element a parser reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Attribute {
    InnerText,
    Href,
    Title,
}

impl TryFrom<String> for Attribute {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "innertext" => Ok(Attribute::InnerText),
            "href" => Ok(Attribute::Href),
            "title" => Ok(Attribute::Title),
            other => Err(format!("invalid attribute type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MatchOperator {
    Contains,
}

impl TryFrom<String> for MatchOperator {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "contains" => Ok(MatchOperator::Contains),
            other => Err(format!("invalid matcher operator: {other}")),
        }
    }
}

/// Element filter applied before the value is read.
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    pub attribute: Attribute,
    pub operator: MatchOperator,
    pub value: String,
}

/// Post-processing applied to an extracted value.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "ReplacerRepr")]
pub struct ReplacerConfig {
    pub regex: Regex,
    pub replacement: String,
}

#[derive(Deserialize)]
struct ReplacerRepr {
    regex: String,
    replacement: String,
}

impl TryFrom<ReplacerRepr> for ReplacerConfig {
    type Error = String;

    fn try_from(repr: ReplacerRepr) -> Result<Self, Self::Error> {
        let regex = Regex::new(&repr.regex)
            .map_err(|err| format!("invalid regex {:?}: {err}", repr.regex))?;
        Ok(ReplacerConfig { regex, replacement: repr.replacement })
    }
}

/// What to read from each matched element. Accepts either a bare attribute
/// string (`value: href`) or a mapping with an optional replacer.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "ValueRepr")]
pub struct ValueConfig {
    pub attribute: Attribute,
    pub replacer: Option<ReplacerConfig>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueRepr {
    Bare(String),
    Full { attribute: Attribute, #[serde(default)] replacer: Option<ReplacerConfig> },
}

impl TryFrom<ValueRepr> for ValueConfig {
    type Error = String;

    fn try_from(repr: ValueRepr) -> Result<Self, Self::Error> {
        match repr {
            ValueRepr::Bare(s) => Ok(ValueConfig { attribute: Attribute::try_from(s)?, replacer: None }),
            ValueRepr::Full { attribute, replacer } => Ok(ValueConfig { attribute, replacer }),
        }
    }
}

/// One selector + attribute + optional matcher/replacer extraction pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserConfig {
    pub selector: String,
    pub value: ValueConfig,
    #[serde(default)]
    pub matcher: Option<MatcherConfig>,
    #[serde(default)]
    pub ext: HashMap<String, String>,
}
