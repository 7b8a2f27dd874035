//! Read-only HTTP surface over the catalogue, plus static serving of the
//! converted images.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tower_http::services::ServeDir;

use crate::application::{Application, Component, RegistryError, ServiceHandle};
use crate::components::database::{self, Database, DbError};

pub const COMPONENT_ID: &str = "api";

const DEFAULT_LIMIT: i64 = 50;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ApiState {
    db: Arc<Database>,
}

pub struct Api {
    server: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Api {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { server: tokio::sync::Mutex::new(None) })
    }
}

/// offset / limit / repeated `tag` params, with the catalogue defaults.
fn parse_query(raw: Option<&str>) -> (i64, i64, Vec<String>) {
    let mut offset = 0;
    let mut limit = DEFAULT_LIMIT;
    let mut tags = Vec::new();
    if let Some(raw) = raw {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "offset" => {
                    if let Ok(n) = value.parse() {
                        offset = n;
                    }
                }
                "limit" => {
                    if let Ok(n) = value.parse() {
                        limit = n;
                    }
                }
                "tag" => tags.push(value.into_owned()),
                _ => {}
            }
        }
    }
    (offset, limit, tags)
}

fn internal_error(err: DbError) -> Response {
    error!(error = %err, "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn list_tags(
    State(state): State<ApiState>,
    Path(source): Path<String>,
    RawQuery(raw): RawQuery,
) -> Response {
    let (offset, limit, _) = parse_query(raw.as_deref());
    match state.db.list_not_group_tags(&source, offset, limit).await {
        Ok(tag_list) => Json(tag_list).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn list_images(
    State(state): State<ApiState>,
    Path(source): Path<String>,
    RawQuery(raw): RawQuery,
) -> Response {
    let (offset, limit, tags) = parse_query(raw.as_deref());
    match state.db.list_downloaded_images(&source, &tags, offset, limit).await {
        Ok(image_list) => Json(image_list).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn get_image(
    State(state): State<ApiState>,
    Path((source, id)): Path<(String, String)>,
) -> Response {
    match state.db.get_image_meta(&source, &id).await {
        Ok(meta) => Json(meta).into_response(),
        Err(err @ DbError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response()
        }
        Err(err) => internal_error(err),
    }
}

#[async_trait]
impl Component for Api {
    fn id(&self) -> &'static str {
        COMPONENT_ID
    }

    fn name(&self) -> &'static str {
        "query api"
    }

    async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()> {
        let db = app
            .get_service(COMPONENT_ID, database::COMPONENT_ID, database::SERVICE_ID)
            .await?
            .downcast::<Database>()
            .map_err(|_| anyhow::anyhow!("unexpected db service type"))?;

        let router = Router::new()
            .route("/{source}/tags", get(list_tags))
            .route("/{source}/images", get(list_images))
            .route("/{source}/image/{id}", get(get_image))
            .nest_service("/image", ServeDir::new(&app.config().image_dir))
            .with_state(ApiState { db });

        let port = app.config().api.port;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "api listening");

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(error = %err, "api server failed");
            }
        });
        *self.server.lock().await = Some((token, handle));
        Ok(())
    }

    async fn unload(self: Arc<Self>) {
        let mut guard = self.server.lock().await;
        if let Some((token, handle)) = guard.take() {
            token.cancel();
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("api server did not drain in time, aborting");
                abort.abort();
            }
        }
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

    #[test]
    fn defaults_apply_when_query_is_absent() {
        let (offset, limit, tags) = parse_query(None);
        assert_eq!(offset, 0);
        assert_eq!(limit, DEFAULT_LIMIT);
        assert!(tags.is_empty());
    }

    #[test]
    fn repeated_tag_params_accumulate() {
        let (offset, limit, tags) = parse_query(Some("offset=20&limit=10&tag=sky&tag=sea"));
        assert_eq!(offset, 20);
        assert_eq!(limit, 10);
        assert_eq!(tags, vec!["sky", "sea"]);
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let (offset, limit, _) = parse_query(Some("offset=abc&limit="));
        assert_eq!(offset, 0);
        assert_eq!(limit, DEFAULT_LIMIT);
    }

    #[test]
    fn tag_values_are_url_decoded() {
        let (_, _, tags) = parse_query(Some("tag=blue%20sky"));
        assert_eq!(tags, vec!["blue sky"]);
    }
}
