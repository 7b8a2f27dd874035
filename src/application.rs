//! Application shell: a dependency-tracked registry of named components.
//!
//! Components register explicitly at startup and load lazily the first time
//! another component asks for one of their services. The registry records
//! who acquired services from whom; shutdown unloads components whose
//! `children` set is empty first, giving a reverse-topological order.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::infrastructure::config::AppConfig;
use crate::infrastructure::cursor::CursorStore;
use crate::infrastructure::logging;

/// Type-erased service handle; callers downcast to the concrete component.
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("component not found: {0}")]
    UnknownComponent(String),
    #[error("component {component} has no service {service}")]
    UnknownService { component: String, service: String },
    #[error("component {component} failed to load")]
    LoadFailed {
        component: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A named, lazily-loaded unit of the pipeline.
///
/// `load` may acquire services from other components through
/// [`Application::get_service`]; those edges drive the unload order.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()>;
    /// Drain background work. Must be safe to call after a failed `load`.
    async fn unload(self: Arc<Self>);
    fn service(self: Arc<Self>, service_id: &str) -> Result<ServiceHandle, RegistryError>;
}

struct ComponentEntry {
    component: Arc<dyn Component>,
    depends: HashSet<String>,
    children: HashSet<String>,
}

impl ComponentEntry {
    fn new(component: Arc<dyn Component>) -> Self {
        Self {
            component,
            depends: HashSet::new(),
            children: HashSet::new(),
        }
    }
}

pub struct Application {
    config: AppConfig,
    cursor: Arc<CursorStore>,
    available: Mutex<HashMap<String, Arc<dyn Component>>>,
    loaded: Mutex<HashMap<String, ComponentEntry>>,
}

impl Application {
    pub fn new(config: AppConfig, cursor: CursorStore) -> Arc<Self> {
        Arc::new(Self {
            config,
            cursor: Arc::new(cursor),
            available: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cursor(&self) -> &Arc<CursorStore> {
        &self.cursor
    }

    /// Make a component known to the registry without loading it.
    pub fn register(&self, component: Arc<dyn Component>) {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        available.insert(component.id().to_string(), component);
    }

    /// Load every component named in the config's `plugins` list. A failed
    /// load is logged and skipped; the rest still come up.
    pub async fn load_enabled(self: &Arc<Self>) {
        let enabled = self.config.plugins.clone();
        for id in enabled {
            info!(component = %id, "start load component");
            if let Err(err) = self.load_component(&id).await {
                error!(component = %id, error = %err, "load component failed");
            }
        }
    }

    /// Acquire `service_id` from `target_id` on behalf of `caller_id`,
    /// loading the target first if needed, and record the dependency edge.
    pub async fn get_service(
        self: &Arc<Self>,
        caller_id: &str,
        target_id: &str,
        service_id: &str,
    ) -> Result<ServiceHandle, RegistryError> {
        let target = {
            let loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
            if !loaded.contains_key(caller_id) {
                return Err(RegistryError::UnknownComponent(caller_id.to_string()));
            }
            loaded.get(target_id).map(|entry| entry.component.clone())
        };
        let target = match target {
            Some(component) => component,
            None => self.load_component(target_id).await?,
        };
        let service = target.clone().service(service_id)?;
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(caller) = loaded.get_mut(caller_id) {
            caller.depends.insert(target_id.to_string());
        }
        if let Some(entry) = loaded.get_mut(target_id) {
            entry.children.insert(caller_id.to_string());
        }
        Ok(service)
    }

    async fn load_component(
        self: &Arc<Self>,
        id: &str,
    ) -> Result<Arc<dyn Component>, RegistryError> {
        let component = {
            let available = self.available.lock().unwrap_or_else(|e| e.into_inner());
            available
                .get(id)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownComponent(id.to_string()))?
        };
        {
            // Reserve the slot before load so nested get_service calls made
            // from inside load can find their caller.
            let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = loaded.get(id) {
                return Ok(entry.component.clone());
            }
            loaded.insert(id.to_string(), ComponentEntry::new(component.clone()));
        }
        match component.clone().load(self).await {
            Ok(()) => {
                info!(component = %id, "component loaded");
                Ok(component)
            }
            Err(err) => {
                component.clone().unload().await;
                let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
                loaded.remove(id);
                Err(RegistryError::LoadFailed {
                    component: id.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Unload everything, children-empty-first. A pass that finds no leaf
    /// while components remain means a dependency cycle; that is logged and
    /// the loop aborts rather than hanging.
    pub async fn shutdown(&self) {
        info!("shutdown begin");
        loop {
            let leaves: Vec<(String, Arc<dyn Component>)> = {
                let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
                if loaded.is_empty() {
                    break;
                }
                let leaf_ids: Vec<String> = loaded
                    .iter()
                    .filter(|(_, entry)| entry.children.is_empty())
                    .map(|(id, _)| id.clone())
                    .collect();
                if leaf_ids.is_empty() {
                    let remaining: Vec<&String> = loaded.keys().collect();
                    error!(?remaining, "dependency cycle among remaining components, aborting shutdown");
                    break;
                }
                let mut removed = Vec::new();
                for id in leaf_ids {
                    if let Some(entry) = loaded.remove(&id) {
                        for dep in &entry.depends {
                            if let Some(dep_entry) = loaded.get_mut(dep) {
                                dep_entry.children.remove(&id);
                            }
                        }
                        removed.push((id, entry.component));
                    }
                }
                removed
            };
            for (id, component) in leaves {
                info!(component = %id, "unload component");
                component.unload().await;
                info!(component = %id, "unload component finish");
            }
        }
        if let Err(err) = self.cursor.save() {
            error!(error = %err, "save runtime config on shutdown failed");
        }
        info!("shutdown finish");
    }

    /// Bring up the enabled components, then block until a termination
    /// signal arrives and unload everything. SIGHUP hot-flushes the cursor
    /// store and rotates the log file.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        self.load_enabled().await;

        let cursor = self.cursor.clone();
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP: flushing page cursors, rotating log file");
                if let Err(err) = cursor.save() {
                    error!(error = %err, "flush on SIGHUP failed");
                }
                logging::rotate();
            }
        });

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
            _ = quit.recv() => info!("received SIGQUIT"),
        }
        self.shutdown().await;
        Ok(())
    }

    #[cfg(test)]
    fn loaded_ids(&self) -> Vec<String> {
        let loaded = self.loaded.lock().unwrap();
        loaded.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
spiders: {}
imageConverter: { quality: 80 }
logger: { level: info, file: { path: /tmp/image-spider-test.log } }
imageDir: /tmp/image-spider-test/images
workDir: /tmp/image-spider-test/work
database: { connection: "postgres://test" }
plugins: []
api: { port: 0 }
dataChecker: {}
"#;

    fn test_app(dir: &std::path::Path) -> Arc<Application> {
        let config: AppConfig = serde_yaml::from_str(TEST_CONFIG).unwrap();
        let cursor = CursorStore::load(dir.join("runtimeConfig.yaml"));
        Application::new(config, cursor)
    }

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct Probe {
        id: &'static str,
        wants: Vec<&'static str>,
        fail_load: bool,
        events: EventLog,
    }

    impl Probe {
        fn new(id: &'static str, wants: Vec<&'static str>, events: EventLog) -> Arc<Self> {
            Arc::new(Self { id, wants, fail_load: false, events })
        }

        fn failing(id: &'static str, events: EventLog) -> Arc<Self> {
            Arc::new(Self { id, wants: vec![], fail_load: true, events })
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            self.id
        }

        async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()> {
            if self.fail_load {
                anyhow::bail!("load refused");
            }
            for target in &self.wants {
                app.get_service(self.id, target, target).await?;
            }
            self.events.lock().unwrap().push(format!("load:{}", self.id));
            Ok(())
        }

        async fn unload(self: Arc<Self>) {
            self.events.lock().unwrap().push(format!("unload:{}", self.id));
        }

        fn service(self: Arc<Self>, service_id: &str) -> Result<ServiceHandle, RegistryError> {
            if service_id == self.id {
                Ok(self)
            } else {
                Err(RegistryError::UnknownService {
                    component: self.id.to_string(),
                    service: service_id.to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn lazy_load_and_reverse_topological_unload() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        // a -> b -> c
        app.register(Probe::new("a", vec!["b"], events.clone()));
        app.register(Probe::new("b", vec!["c"], events.clone()));
        app.register(Probe::new("c", vec![], events.clone()));

        app.load_component("a").await.unwrap();
        let mut loaded = app.loaded_ids();
        loaded.sort();
        assert_eq!(loaded, vec!["a", "b", "c"]);

        app.shutdown().await;
        assert!(app.loaded_ids().is_empty());
        let log = events.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["load:c", "load:b", "load:a", "unload:a", "unload:b", "unload:c"]
        );
    }

    #[tokio::test]
    async fn shared_dependency_unloads_last() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        app.register(Probe::new("left", vec!["db"], events.clone()));
        app.register(Probe::new("right", vec!["db"], events.clone()));
        app.register(Probe::new("db", vec![], events.clone()));

        app.load_component("left").await.unwrap();
        app.load_component("right").await.unwrap();
        app.shutdown().await;

        let log = events.lock().unwrap().clone();
        let unload_db = log.iter().position(|e| e == "unload:db").unwrap();
        let unload_left = log.iter().position(|e| e == "unload:left").unwrap();
        let unload_right = log.iter().position(|e| e == "unload:right").unwrap();
        assert!(unload_db > unload_left);
        assert!(unload_db > unload_right);
    }

    #[tokio::test]
    async fn load_failure_rolls_back_and_unloads() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        app.register(Probe::failing("broken", events.clone()));

        let result = app.load_component("broken").await;
        assert!(matches!(result, Err(RegistryError::LoadFailed { .. })));
        assert!(app.loaded_ids().is_empty());
        assert_eq!(events.lock().unwrap().clone(), vec!["unload:broken"]);
    }

    #[tokio::test]
    async fn unknown_component_and_caller_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        app.register(Probe::new("a", vec![], events.clone()));
        app.load_component("a").await.unwrap();

        let err = app.get_service("a", "ghost", "ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownComponent(_)));
        let err = app.get_service("ghost", "a", "a").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownComponent(_)));
    }

    #[tokio::test]
    async fn cycle_aborts_shutdown_instead_of_hanging() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        // Mutual dependency: each acquires the other during load.
        app.register(Probe::new("ping", vec!["pong"], events.clone()));
        app.register(Probe::new("pong", vec!["ping"], events.clone()));

        app.load_component("ping").await.unwrap();
        app.shutdown().await;

        // Neither is a leaf, so neither unloads and both stay registered.
        let mut remaining = app.loaded_ids();
        remaining.sort();
        assert_eq!(remaining, vec!["ping", "pong"]);
        assert!(!events.lock().unwrap().iter().any(|e| e.starts_with("unload")));
    }

    #[tokio::test]
    async fn service_downcasts_to_concrete_component() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        app.register(Probe::new("a", vec![], events.clone()));
        app.register(Probe::new("b", vec![], events.clone()));
        app.load_component("a").await.unwrap();

        let handle = app.get_service("a", "b", "b").await.unwrap();
        let probe = handle.downcast::<Probe>().unwrap();
        assert_eq!(probe.id(), "b");
    }
}
