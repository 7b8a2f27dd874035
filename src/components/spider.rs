//! Per-source crawl engine: state-machine-driven paginated discovery and
//! metadata ingestion.
//!
//! The engine keeps a persisted stack of page cursors per source. The top of
//! the stack is the last fully processed page; each fetch run starts at
//! top+1 and walks forward until the site runs out of pages, the new-data
//! window is exhausted, or an error stops the run. `replace_stack_top` fires
//! only after a page's ids are fully processed, so a crash mid-page resumes
//! that same page.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::OnceCell;
use reqwest::Client;
use scraper::Html;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::{Application, Component, RegistryError, ServiceHandle};
use crate::components::checker::{self, DataChecker};
use crate::components::database::{self, Database};
use crate::components::downloader::{self, ImageDownloader};
use crate::components::worker_pool::WorkerPool;
use crate::domain::ImageMeta;
use crate::infrastructure::config::{
    ListParserConfig, MetaParserConfig, ParserConfig, SpiderConfig, ID_PLACEHOLDER,
    PAGE_PLACEHOLDER,
};
use crate::infrastructure::cursor::CursorStore;
use crate::infrastructure::extractor::Extractor;
use crate::infrastructure::http::{self, FetchError, RetryPolicy};

pub const COMPONENT_ID: &str = "spider";

const PAGE_DUMP_FILE: &str = "page.html";
const ERROR_DUMP_FILE: &str = "lastError.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpiderState {
    Init,
    Running,
    Error,
    Finished,
    EarlyStop,
}

#[derive(Debug)]
enum SpiderEvent {
    GetPage(i64),
    Error(anyhow::Error),
    Finish,
    EarlyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    GetPage,
    Error,
    Finish,
    EarlyStop,
}

impl SpiderEvent {
    fn kind(&self) -> EventKind {
        match self {
            SpiderEvent::GetPage(_) => EventKind::GetPage,
            SpiderEvent::Error(_) => EventKind::Error,
            SpiderEvent::Finish => EventKind::Finish,
            SpiderEvent::EarlyStop => EventKind::EarlyStop,
        }
    }
}

/// Transition table; first row matching (state, event kind) wins.
const TRANSITIONS: &[(&[SpiderState], EventKind, SpiderState)] = &[
    (&[SpiderState::Init, SpiderState::Running], EventKind::GetPage, SpiderState::Running),
    (&[SpiderState::Running], EventKind::Error, SpiderState::Error),
    (&[SpiderState::Running], EventKind::Finish, SpiderState::Finished),
    (&[SpiderState::Running], EventKind::EarlyStop, SpiderState::EarlyStop),
];

fn transition(state: SpiderState, kind: EventKind) -> Option<SpiderState> {
    TRANSITIONS
        .iter()
        .find(|(from, on, _)| *on == kind && from.contains(&state))
        .map(|(_, _, to)| *to)
}

/// Outcome of one fetch run, reported to the outer per-source loop.
#[derive(Debug, PartialEq, Eq)]
enum CrawlOutcome {
    Success,
    Error,
    Stop,
}

/// Crawl-run context: whether this run has ingested anything new yet, and
/// how many consecutive already-known ids it has walked over since.
#[derive(Debug, Default)]
struct CrawlContext {
    has_new_data: bool,
    old_data_count: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum HitAction {
    Finish,
    Continue,
}

/// Decide what an already-known id means for this run.
fn on_known_id(ctx: &mut CrawlContext, page: i64, tolerance: u32) -> HitAction {
    ctx.old_data_count += 1;
    if ctx.has_new_data {
        if ctx.old_data_count >= tolerance {
            // Walked off the tail of the new-data window.
            HitAction::Finish
        } else {
            HitAction::Continue
        }
    } else if page == 1 {
        // Freshest page carries nothing new: the whole crawl is done.
        HitAction::Finish
    } else {
        HitAction::Continue
    }
}

fn on_new_id(ctx: &mut CrawlContext) {
    ctx.has_new_data = true;
    ctx.old_data_count = 0;
}

#[derive(Debug, Error)]
enum MetaError {
    #[error("meta fetch stopped")]
    Stop,
    #[error(transparent)]
    Fatal(anyhow::Error),
}

/// Everything run_page needs from a listing document, extracted before any
/// suspension point.
struct ListPage {
    ids: Vec<String>,
    page: i64,
    last_page: bool,
}

fn extract_all(config: &ParserConfig, doc: &Html) -> anyhow::Result<Vec<String>> {
    Ok(Extractor::new(config)?.extract(doc))
}

fn parse_list_page(body: &str, config: &ListParserConfig) -> anyhow::Result<ListPage> {
    let doc = Html::parse_document(body);
    let ids = extract_all(&config.id, &doc)?;
    if ids.is_empty() {
        anyhow::bail!("no post ids on page");
    }
    let page_nums = extract_all(&config.page_num, &doc)?;
    let Some(first) = page_nums.first() else {
        anyhow::bail!("no page number on page");
    };
    let page: i64 = first
        .trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("page number {first:?} unparsable: {err}"))?;
    let last_page = extract_all(&config.next_page, &doc)?.is_empty();
    Ok(ListPage { ids, page, last_page })
}

fn parse_meta_page(
    body: &str,
    config: &MetaParserConfig,
    id: &str,
    source: &str,
) -> anyhow::Result<ImageMeta> {
    let doc = Html::parse_document(body);
    let mut tags = Vec::new();
    for tag_parser in &config.tags {
        match extract_all(tag_parser, &doc) {
            Ok(values) if !values.is_empty() => tags.extend(values),
            _ => continue,
        }
    }
    let image_urls = extract_all(&config.image_url, &doc)?;
    let Some(image_url) = image_urls.first() else {
        anyhow::bail!("no image url on meta page");
    };
    let post_times = extract_all(&config.post_time, &doc)?;
    let Some(raw_time) = post_times.first() else {
        anyhow::bail!("no post time on meta page");
    };
    let format = config
        .post_time
        .ext
        .get("format")
        .ok_or_else(|| anyhow::anyhow!("postTime parser lacks ext.format"))?;
    let post_time = parse_post_time(raw_time, format)?;
    Ok(ImageMeta {
        id: id.to_string(),
        source_id: source.to_string(),
        tags,
        image_url: image_url.clone(),
        local_path: None,
        post_time,
    })
}

/// Parse with the configured pattern; formats without a zone are read as UTC.
fn parse_post_time(value: &str, format: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(zoned) = DateTime::parse_from_str(value, format) {
        return Ok(zoned.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, format)
        .map_err(|err| anyhow::anyhow!("post time {value:?} does not match {format:?}: {err}"))?;
    Ok(Utc.from_utc_datetime(&naive))
}

pub struct Spider {
    pool: WorkerPool,
    db: OnceCell<Arc<Database>>,
    cursor: OnceCell<Arc<CursorStore>>,
    work_dir: OnceCell<PathBuf>,
}

impl Spider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pool: WorkerPool::new(),
            db: OnceCell::new(),
            cursor: OnceCell::new(),
            work_dir: OnceCell::new(),
        })
    }

    async fn run_source(self: Arc<Self>, config: SpiderConfig) {
        let source = config.id.clone();
        info!(source, "spider started");
        let (Some(db), Some(cursor)) = (self.db.get(), self.cursor.get()) else {
            error!(source, "spider started before load finished");
            return;
        };
        // Seed page zero so the crawl starts from the newest page.
        cursor.append_stack(&source, 0);
        if let Err(err) = db.init_source(&source).await {
            error!(source, error = %err, "init source failed");
            self.pool.stop_token().cancelled().await;
            return;
        }
        let client = match http::build_client(config.meta_downloader.connect_timeout) {
            Ok(client) => client,
            Err(err) => {
                error!(source, error = %err, "building crawl client failed");
                self.pool.stop_token().cancelled().await;
                return;
            }
        };
        loop {
            while let Some(top) = cursor.stack_top(&source) {
                debug!(source, start = top, "page fetching");
                match self.fetch_pages_from(&client, &config, top).await {
                    CrawlOutcome::Stop => {
                        info!(source, "spider stopped");
                        return;
                    }
                    CrawlOutcome::Success => debug!(source, start = top, "page finish"),
                    CrawlOutcome::Error => debug!(source, start = top, "page error"),
                }
            }
            info!(source, "all pages finished, waiting for next refresh");
            cursor.append_stack(&source, 0);
            if !self
                .pool
                .idle(Duration::from_secs(config.meta_downloader.refresh_interval))
                .await
            {
                info!(source, "spider stopped");
                return;
            }
            info!(source, "refreshing now");
        }
    }

    /// Drive the fetch-page state machine from `start_page + 1` until a
    /// terminal state. Finishing pops the cursor stack; an early stop leaves
    /// it untouched for the next run.
    async fn fetch_pages_from(
        &self,
        client: &Client,
        config: &SpiderConfig,
        start_page: i64,
    ) -> CrawlOutcome {
        let mut ctx = CrawlContext::default();
        let mut state = SpiderState::Init;
        let mut pending = Some(SpiderEvent::GetPage(start_page + 1));
        while let Some(event) = pending.take() {
            let Some(next) = transition(state, event.kind()) else {
                warn!(?state, kind = ?event.kind(), "event has no transition, dropping");
                break;
            };
            state = next;
            match event {
                SpiderEvent::GetPage(page) => {
                    debug!(source = %config.id, page, "fetch list state run");
                    pending = Some(self.run_page(client, config, page, &mut ctx).await);
                }
                SpiderEvent::Error(err) => {
                    warn!(source = %config.id, error = %err, "fetch list state error");
                }
                SpiderEvent::Finish => {
                    debug!(source = %config.id, "fetch list state finish");
                    if let Some(cursor) = self.cursor.get() {
                        cursor.stack_pop(&config.id);
                    }
                }
                SpiderEvent::EarlyStop => {
                    debug!(source = %config.id, "fetch list state early stop");
                }
            }
        }
        info!(source = %config.id, start = start_page, ?state, "fetch list finish");
        match state {
            SpiderState::EarlyStop => CrawlOutcome::Stop,
            SpiderState::Finished => CrawlOutcome::Success,
            _ => CrawlOutcome::Error,
        }
    }

    /// Fetch and scan one listing page; returns the next event for the
    /// state machine.
    async fn run_page(
        &self,
        client: &Client,
        config: &SpiderConfig,
        page_no: i64,
        ctx: &mut CrawlContext,
    ) -> SpiderEvent {
        let stop = self.pool.stop_token();
        if stop.is_cancelled() {
            return SpiderEvent::EarlyStop;
        }
        let (Some(db), Some(cursor)) = (self.db.get(), self.cursor.get()) else {
            return SpiderEvent::EarlyStop;
        };
        let url = config
            .list_parser
            .url_template
            .replace(PAGE_PLACEHOLDER, &page_no.to_string());
        info!(source = %config.id, page = page_no, url = %url, "start fetch page");
        let policy = RetryPolicy::new(
            config.meta_downloader.error_retry_interval,
            config.meta_downloader.error_retry_max_count,
        );
        let body = match http::get_text_with_retry(
            client,
            &url,
            &config.list_parser.headers,
            policy,
            &stop,
        )
        .await
        {
            Ok(body) => body,
            Err(FetchError::Cancelled) => return SpiderEvent::EarlyStop,
            Err(err) => return SpiderEvent::Error(err.into()),
        };
        self.dump(PAGE_DUMP_FILE, &body).await;
        let list = match parse_list_page(&body, &config.list_parser) {
            Ok(list) => list,
            Err(err) => {
                error!(source = %config.id, page = page_no, error = %err, "list page unusable");
                self.dump(ERROR_DUMP_FILE, &body).await;
                return SpiderEvent::Error(err);
            }
        };
        for id in &list.ids {
            match db.get_meta(id, &config.id).await {
                Err(err) => return SpiderEvent::Error(err.into()),
                Ok(Some(_)) => {
                    debug!(source = %config.id, id, "already fetched");
                    match on_known_id(ctx, list.page, config.meta_downloader.same_id_tolerance) {
                        HitAction::Finish => {
                            info!(source = %config.id, page = list.page, "crawl window exhausted");
                            return SpiderEvent::Finish;
                        }
                        HitAction::Continue => continue,
                    }
                }
                Ok(None) => {
                    debug!(source = %config.id, id, "new data");
                    match self.fetch_meta(client, id, config, ctx).await {
                        Ok(()) => {}
                        Err(MetaError::Stop) => return SpiderEvent::EarlyStop,
                        Err(MetaError::Fatal(err)) => {
                            error!(source = %config.id, id, error = %err, "fetch meta failed");
                            return SpiderEvent::Error(err);
                        }
                    }
                }
            }
        }
        // Every id on this page is ingested or known; record it as done.
        debug!(source = %config.id, page = list.page, "page finished, goto next page");
        cursor.replace_stack_top(&config.id, list.page);
        if list.last_page {
            info!(source = %config.id, page = list.page, "is last page, finish now");
            SpiderEvent::Finish
        } else {
            SpiderEvent::GetPage(list.page + 1)
        }
    }

    async fn fetch_meta(
        &self,
        client: &Client,
        id: &str,
        config: &SpiderConfig,
        ctx: &mut CrawlContext,
    ) -> Result<(), MetaError> {
        let stop = self.pool.stop_token();
        if stop.is_cancelled() {
            return Err(MetaError::Stop);
        }
        let db = self.db.get().ok_or(MetaError::Stop)?;
        let url = config.meta_parser.url_template.replace(ID_PLACEHOLDER, id);
        info!(source = %config.id, meta_id = id, url = %url, "start fetch meta");
        let policy = RetryPolicy::new(
            config.meta_downloader.error_retry_interval,
            config.meta_downloader.error_retry_max_count,
        );
        let body = match http::get_text_with_retry(
            client,
            &url,
            &config.meta_parser.headers,
            policy,
            &stop,
        )
        .await
        {
            Ok(body) => body,
            Err(FetchError::Cancelled) => return Err(MetaError::Stop),
            Err(err) => return Err(MetaError::Fatal(err.into())),
        };
        let meta = match parse_meta_page(&body, &config.meta_parser, id, &config.id) {
            Ok(meta) => meta,
            Err(err) => {
                self.dump(ERROR_DUMP_FILE, &body).await;
                return Err(MetaError::Fatal(err));
            }
        };
        on_new_id(ctx);
        debug!(source = %config.id, meta_id = id, tags = meta.tags.len(), "save new meta");
        db.insert_meta(&meta)
            .await
            .map_err(|err| MetaError::Fatal(err.into()))?;
        Ok(())
    }

    /// Best-effort debug dump into the work directory.
    async fn dump(&self, name: &str, body: &str) {
        if let Some(work_dir) = self.work_dir.get() {
            if let Err(err) = tokio::fs::write(work_dir.join(name), body).await {
                warn!(file = name, error = %err, "debug dump failed");
            }
        }
    }
}

#[async_trait]
impl Component for Spider {
    fn id(&self) -> &'static str {
        COMPONENT_ID
    }

    fn name(&self) -> &'static str {
        "spider"
    }

    async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()> {
        let spiders = app.config().spiders.clone();
        if spiders.is_empty() {
            anyhow::bail!("no spiders configured");
        }
        let _ = self.cursor.set(app.cursor().clone());
        let _ = self.work_dir.set(app.config().work_dir.clone());
        tokio::fs::create_dir_all(&app.config().work_dir).await?;

        let db = app
            .get_service(COMPONENT_ID, database::COMPONENT_ID, database::SERVICE_ID)
            .await?
            .downcast::<Database>()
            .map_err(|_| anyhow::anyhow!("unexpected db service type"))?;
        let _ = self.db.set(db);
        let image_downloader = app
            .get_service(COMPONENT_ID, downloader::COMPONENT_ID, downloader::SERVICE_ID)
            .await?
            .downcast::<ImageDownloader>()
            .map_err(|_| anyhow::anyhow!("unexpected downloader service type"))?;
        let data_checker = app
            .get_service(COMPONENT_ID, checker::COMPONENT_ID, checker::SERVICE_ID)
            .await?
            .downcast::<DataChecker>()
            .map_err(|_| anyhow::anyhow!("unexpected checker service type"))?;

        for (source, spider_config) in spiders {
            image_downloader.add_source(source.clone(), spider_config.image_downloader.clone());
            data_checker.start_checking(source.clone());
            let this = self.clone();
            self.pool.spawn(async move {
                this.run_source(spider_config).await;
            });
        }
        Ok(())
    }

    async fn unload(self: Arc<Self>) {
        self.pool.drain().await;
    }

    fn service(self: Arc<Self>, service_id: &str) -> Result<ServiceHandle, RegistryError> {
        Err(RegistryError::UnknownService {
            component: COMPONENT_ID.to_string(),
            service: service_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::{Attribute, ValueConfig};
    use std::collections::HashMap;

    fn parser(selector: &str, attribute: Attribute) -> ParserConfig {
        ParserConfig {
            selector: selector.to_string(),
            value: ValueConfig { attribute, replacer: None },
            matcher: None,
            ext: HashMap::new(),
        }
    }

    fn list_config() -> ListParserConfig {
        ListParserConfig {
            url_template: "https://x.example/list?p=__PAGE__".to_string(),
            headers: HashMap::new(),
            id: parser("a.post", Attribute::Href),
            page_num: parser("span.current", Attribute::InnerText),
            next_page: parser("a.next", Attribute::Href),
        }
    }

    #[test]
    fn transition_table_covers_the_spec() {
        assert_eq!(transition(SpiderState::Init, EventKind::GetPage), Some(SpiderState::Running));
        assert_eq!(transition(SpiderState::Running, EventKind::GetPage), Some(SpiderState::Running));
        assert_eq!(transition(SpiderState::Running, EventKind::Error), Some(SpiderState::Error));
        assert_eq!(transition(SpiderState::Running, EventKind::Finish), Some(SpiderState::Finished));
        assert_eq!(transition(SpiderState::Running, EventKind::EarlyStop), Some(SpiderState::EarlyStop));
    }

    #[test]
    fn events_without_transition_are_dropped() {
        assert_eq!(transition(SpiderState::Init, EventKind::Finish), None);
        assert_eq!(transition(SpiderState::Error, EventKind::GetPage), None);
        assert_eq!(transition(SpiderState::Finished, EventKind::Finish), None);
    }

    #[test]
    fn first_page_of_only_known_ids_finishes() {
        let mut ctx = CrawlContext::default();
        assert_eq!(on_known_id(&mut ctx, 1, 2), HitAction::Finish);
    }

    #[test]
    fn known_ids_deep_in_backlog_are_skipped() {
        // No new data yet and not the first page: keep scanning.
        let mut ctx = CrawlContext::default();
        assert_eq!(on_known_id(&mut ctx, 7, 2), HitAction::Continue);
        assert_eq!(on_known_id(&mut ctx, 7, 2), HitAction::Continue);
    }

    #[test]
    fn tolerance_counts_consecutive_known_ids() {
        // 2 new, 1 old, 2 new, 4 old with tolerance 3: the third consecutive
        // old id after the last new one finishes the run.
        let tolerance = 3;
        let mut ctx = CrawlContext::default();
        on_new_id(&mut ctx);
        on_new_id(&mut ctx);
        assert_eq!(on_known_id(&mut ctx, 2, tolerance), HitAction::Continue);
        on_new_id(&mut ctx);
        on_new_id(&mut ctx);
        assert_eq!(on_known_id(&mut ctx, 2, tolerance), HitAction::Continue);
        assert_eq!(on_known_id(&mut ctx, 2, tolerance), HitAction::Continue);
        assert_eq!(on_known_id(&mut ctx, 2, tolerance), HitAction::Finish);
    }

    #[test]
    fn tolerance_carries_across_pages() {
        // Page 1 ends with one old id, page 2 starts with another: together
        // they reach tolerance 2.
        let mut ctx = CrawlContext::default();
        on_new_id(&mut ctx);
        assert_eq!(on_known_id(&mut ctx, 1, 2), HitAction::Continue);
        assert_eq!(on_known_id(&mut ctx, 2, 2), HitAction::Finish);
    }

    #[test]
    fn parses_listing_page() {
        let body = r#"
            <div>
              <a class="post" href="/post/11">one</a>
              <a class="post" href="/post/12">two</a>
              <span class="current">4</span>
              <a class="next" href="/list?p=5">next</a>
            </div>
        "#;
        let list = parse_list_page(body, &list_config()).unwrap();
        assert_eq!(list.ids, vec!["/post/11", "/post/12"]);
        assert_eq!(list.page, 4);
        assert!(!list.last_page);
    }

    #[test]
    fn missing_next_page_marks_last() {
        let body = r#"
            <a class="post" href="/post/11">one</a>
            <span class="current">9</span>
        "#;
        let list = parse_list_page(body, &list_config()).unwrap();
        assert!(list.last_page);
    }

    #[test]
    fn empty_id_list_is_an_error() {
        let body = r#"<span class="current">1</span><a class="next" href="x">n</a>"#;
        assert!(parse_list_page(body, &list_config()).is_err());
    }

    #[test]
    fn unparsable_page_number_is_an_error() {
        let body = r#"
            <a class="post" href="/post/11">one</a>
            <span class="current">n/a</span>
        "#;
        assert!(parse_list_page(body, &list_config()).is_err());
    }

    fn meta_config() -> MetaParserConfig {
        MetaParserConfig {
            url_template: "https://x.example/post/__ID__".to_string(),
            headers: HashMap::new(),
            tags: vec![parser("li.tag", Attribute::InnerText), parser("li.artist", Attribute::InnerText)],
            image_url: parser("img#main", Attribute::Title),
            post_time: ParserConfig {
                ext: HashMap::from([("format".to_string(), "%Y-%m-%d %H:%M:%S".to_string())]),
                ..parser("time.posted", Attribute::InnerText)
            },
        }
    }

    #[test]
    fn parses_meta_page() {
        let body = r#"
            <ul>
              <li class="tag">landscape</li>
              <li class="tag">sky</li>
              <li class="artist">someone</li>
            </ul>
            <img id="main" title="https://cdn.example/full/abc.png"/>
            <time class="posted">2024-05-01 12:30:00</time>
        "#;
        let meta = parse_meta_page(body, &meta_config(), "77", "demo").unwrap();
        assert_eq!(meta.id, "77");
        assert_eq!(meta.source_id, "demo");
        assert_eq!(meta.tags, vec!["landscape", "sky", "someone"]);
        assert_eq!(meta.image_url, "https://cdn.example/full/abc.png");
        assert_eq!(meta.post_time, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        assert!(meta.local_path.is_none());
    }

    #[test]
    fn meta_without_image_url_is_an_error() {
        let body = r#"<time class="posted">2024-05-01 12:30:00</time>"#;
        assert!(parse_meta_page(body, &meta_config(), "77", "demo").is_err());
    }

    #[test]
    fn empty_tag_parsers_are_skipped_not_fatal() {
        let body = r#"
            <img id="main" title="https://cdn.example/full/abc.png"/>
            <time class="posted">2024-05-01 12:30:00</time>
        "#;
        let meta = parse_meta_page(body, &meta_config(), "77", "demo").unwrap();
        assert!(meta.tags.is_empty());
    }

    #[test]
    fn post_time_with_zone_is_normalised_to_utc() {
        let t = parse_post_time("2024-05-01 12:30:00 +0900", "%Y-%m-%d %H:%M:%S %z").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 3, 30, 0).unwrap());
    }

    #[test]
    fn post_time_without_zone_is_read_as_utc() {
        let t = parse_post_time("2024-05-01 12:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
    }
}
