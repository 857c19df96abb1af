//! App Core for the extension host.
//!
//! Central struct holding the shared services and the runtime coordinator,
//! managing application lifecycle.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::database::connection::Database;
use crate::host::{PageRenderer, PermissionPrompt, TabHost};
use crate::managers::extension_registry::ExtensionRegistry;
use crate::managers::permission_manager::PermissionManager;
use crate::services::extension_runtime::{ExtensionRuntime, RuntimeServices, StartupReport};
use crate::services::message_router::MessageRouter;
use crate::services::storage_engine::StorageEngine;
#[cfg(feature = "network")]
use crate::services::store_installer::StoreInstaller;
use crate::services::web_request::WebRequestInterceptor;
use crate::types::config::RuntimeConfig;
use crate::types::errors::RuntimeError;

/// The shell-side implementations the runtime calls out to.
#[derive(Clone)]
pub struct HostCollaborators {
    pub pages: Arc<dyn PageRenderer>,
    pub tabs: Arc<dyn TabHost>,
    pub prompt: Arc<dyn PermissionPrompt>,
}

/// Central application struct holding all services.
///
/// Must be created inside a tokio runtime: the coordinator and the message
/// router run as tasks on it.
pub struct App {
    pub config: Arc<RuntimeConfig>,
    pub db: Arc<Database>,
    pub permissions: Arc<PermissionManager>,
    pub storage: Arc<StorageEngine>,
    pub interceptor: Arc<WebRequestInterceptor>,
    pub router: Arc<MessageRouter>,
    pub runtime: ExtensionRuntime,
    #[cfg(feature = "network")]
    pub store: StoreInstaller,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    /// Creates a new App, opening the database and registry under the configured data dir.
    pub fn new(config: RuntimeConfig, collaborators: HostCollaborators) -> Result<Self, Box<dyn std::error::Error>> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| format!("Cannot create data dir {}: {}", config.data_dir.display(), e))?;
        let db = Arc::new(Database::open(config.database_path())?);
        Self::with_database(config, db, collaborators)
    }

    /// Creates an App over an already opened database.
    pub fn with_database(
        config: RuntimeConfig,
        db: Arc<Database>,
        collaborators: HostCollaborators,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let config = Arc::new(config);
        let registry = ExtensionRegistry::load(config.registry_path())?;

        let permissions = Arc::new(PermissionManager::new(
            db.clone(),
            collaborators.prompt.clone(),
            config.auto_grant_trusted,
        ));
        let storage = Arc::new(StorageEngine::new(db.clone(), config.quotas));
        let interceptor = Arc::new(WebRequestInterceptor::new());
        let router = Arc::new(MessageRouter::new(
            config.clone(),
            permissions.clone(),
            storage.clone(),
            interceptor.clone(),
            collaborators.pages.clone(),
            collaborators.tabs.clone(),
        ));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let router_task = tokio::spawn(router.clone().run(outbound_rx));

        let runtime = ExtensionRuntime::spawn(
            RuntimeServices {
                config: config.clone(),
                permissions: permissions.clone(),
                storage: storage.clone(),
                router: router.clone(),
                renderer: collaborators.pages.clone(),
                outbound: outbound_tx,
            },
            registry,
        );

        #[cfg(feature = "network")]
        let store = StoreInstaller::new(&config, runtime.clone())?;

        Ok(Self {
            config,
            db,
            permissions,
            storage,
            interceptor,
            router,
            runtime,
            #[cfg(feature = "network")]
            store,
            router_task: Mutex::new(Some(router_task)),
        })
    }

    /// Startup sequence: reconcile the registry and start enabled extensions.
    pub async fn startup(&self) -> Result<StartupReport, RuntimeError> {
        let report = self.runtime.startup().await?;
        info!(
            target: "app",
            started = report.started.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "extension host started"
        );
        Ok(report)
    }

    /// Shutdown sequence: stop every background host, then the router.
    pub async fn shutdown(&self) {
        let _ = self.runtime.shutdown().await;
        self.stop_router();
        info!(target: "app", "extension host stopped");
    }

    fn stop_router(&self) {
        let task = self.router_task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.stop_router();
    }
}
