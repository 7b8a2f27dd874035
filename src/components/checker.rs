//! Background verification that committed rows still have their on-disk
//! artifact. A row whose file went missing gets its path cleared, which
//! puts it back into the download pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{error, info, warn};

use crate::application::{Application, Component, RegistryError, ServiceHandle};
use crate::components::database::{self, Database};
use crate::components::worker_pool::WorkerPool;
use crate::infrastructure::config::DataCheckerConfig;

pub const COMPONENT_ID: &str = "data-checker";
pub const SERVICE_ID: &str = "data-checker";

/// What to do once a batch has been verified.
#[derive(Debug, PartialEq, Eq)]
enum ScanStep {
    /// Full batch: keep paginating.
    Continue { next_offset: i64 },
    /// Short batch after a dirty scan: offsets shifted, rescan now.
    RestartNow,
    /// Short batch, clean scan: idle for the long interval first.
    RestartAfterIdle,
}

fn after_batch(returned: i64, batch_size: i64, offset: i64, dirty: bool) -> ScanStep {
    if returned < batch_size {
        if dirty {
            ScanStep::RestartNow
        } else {
            ScanStep::RestartAfterIdle
        }
    } else {
        ScanStep::Continue { next_offset: offset + returned }
    }
}

pub struct DataChecker {
    pool: WorkerPool,
    db: OnceCell<Arc<Database>>,
    image_dir: OnceCell<PathBuf>,
    config: OnceCell<DataCheckerConfig>,
}

impl DataChecker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pool: WorkerPool::new(),
            db: OnceCell::new(),
            image_dir: OnceCell::new(),
            config: OnceCell::new(),
        })
    }

    /// Start the verification loop for one source.
    pub fn start_checking(self: &Arc<Self>, source: String) {
        let this = self.clone();
        self.pool.spawn(async move {
            this.run_source(source).await;
        });
    }

    async fn run_source(self: Arc<Self>, source: String) {
        info!(source, "data checker started");
        let (Some(db), Some(image_dir), Some(config)) =
            (self.db.get(), self.image_dir.get(), self.config.get())
        else {
            error!(source, "data checker started before load finished");
            return;
        };
        let interval = Duration::from_secs(config.interval);
        let restart_interval = Duration::from_secs(config.restart_interval);
        'scan: loop {
            let mut offset: i64 = 0;
            let mut dirty = false;
            loop {
                if self.pool.is_stopped() {
                    break 'scan;
                }
                let page = match db
                    .list_downloaded_images(&source, &[], offset, config.batch_size)
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        error!(source, error = %err, "listing downloaded rows failed");
                        break;
                    }
                };
                for meta in &page.image_list {
                    let Some(rel) = meta.local_path.as_deref() else { continue };
                    if artifact_missing(image_dir, rel).await {
                        warn!(source, id = %meta.id, path = rel, "artifact missing, clearing local path");
                        dirty = true;
                        let mut cleared = meta.clone();
                        cleared.local_path = None;
                        if let Err(err) = db.update_local_path(&cleared).await {
                            error!(source, id = %meta.id, error = %err, "clearing local path failed");
                        }
                    }
                }
                match after_batch(page.image_list.len() as i64, config.batch_size, offset, dirty) {
                    ScanStep::Continue { next_offset } => {
                        offset = next_offset;
                        if !self.pool.idle(interval).await {
                            break 'scan;
                        }
                    }
                    ScanStep::RestartNow => {
                        info!(source, "scan found damage, restarting immediately");
                        offset = 0;
                        dirty = false;
                    }
                    ScanStep::RestartAfterIdle => {
                        info!(source, "scan clean");
                        break;
                    }
                }
            }
            if !self.pool.idle(restart_interval).await {
                break;
            }
        }
        info!(source, "data checker stopped");
    }
}

async fn artifact_missing(image_dir: &Path, relative: &str) -> bool {
    !tokio::fs::try_exists(image_dir.join(relative)).await.unwrap_or(false)
}

#[async_trait]
impl Component for DataChecker {
    fn id(&self) -> &'static str {
        COMPONENT_ID
    }

    fn name(&self) -> &'static str {
        "data checker"
    }

    async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()> {
        let db = app
            .get_service(COMPONENT_ID, database::COMPONENT_ID, database::SERVICE_ID)
            .await?
            .downcast::<Database>()
            .map_err(|_| anyhow::anyhow!("unexpected db service type"))?;
        let _ = self.db.set(db);
        let _ = self.image_dir.set(app.config().image_dir.clone());
        let _ = self.config.set(app.config().data_checker.clone());
        Ok(())
    }

    async fn unload(self: Arc<Self>) {
        self.pool.drain().await;
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
