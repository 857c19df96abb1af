//! Extension runtime coordinator.
//!
//! Drives install, uninstall, enable and disable, and wires the components
//! together. One actor task owns the registry and the loaded set; the
//! cloneable [`ExtensionRuntime`] handle talks to it over a channel.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::host::{PageRenderer, UserScript};
use crate::managers::extension_registry::ExtensionRegistry;
use crate::managers::permission_manager::{PermissionManager, PermissionManagerTrait};
use crate::services::background_host::{BackgroundHost, HostHandle, HostOutbound, HostSpec};
use crate::services::content_matcher::{ContentScriptMatcher, FrameKind};
use crate::services::extension_files::{copy_dir_all, remove_dir_if_exists};
use crate::services::listener_registry::{ListenerRegistry, SubscriptionHandle};
use crate::services::manifest_parser::ManifestParser;
use crate::services::message_router::MessageRouter;
use crate::services::storage_engine::StorageEngine;
use crate::types::config::RuntimeConfig;
use crate::types::errors::{BackgroundScriptError, ManifestError, PermissionError, RuntimeError};
use crate::types::extension::{
    ExtensionEvent, ExtensionState, ExtensionSummary, InstallReason, InstallSource, InstalledExtension,
};
use crate::types::manifest::Manifest;
use crate::types::message::PageId;
use crate::types::permission::PermissionOutcome;

/// Stable id from name, version, declared permissions and source path, in the `a`-`p` alphabet.
pub fn derive_extension_id(manifest: &Manifest, source: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest.name.as_bytes());
    hasher.update([0]);
    hasher.update(manifest.version.as_bytes());
    hasher.update([0]);
    for permission in manifest.declared_permissions() {
        hasher.update(permission.as_bytes());
        hasher.update([0]);
    }
    hasher.update(source.to_string_lossy().as_bytes());
    hasher
        .finalize()
        .iter()
        .take(16)
        .flat_map(|byte| [byte >> 4, byte & 0x0f])
        .map(|nibble| char::from(b'a' + nibble))
        .collect()
}

/// Components the coordinator drives.
pub struct RuntimeServices {
    pub config: Arc<RuntimeConfig>,
    pub permissions: Arc<PermissionManager>,
    pub storage: Arc<StorageEngine>,
    pub router: Arc<MessageRouter>,
    pub renderer: Arc<dyn PageRenderer>,
    /// Sender half every background host reports to.
    pub outbound: mpsc::UnboundedSender<HostOutbound>,
}

/// What [`ExtensionRuntime::startup`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Entries dropped as duplicates or because their files are gone.
    pub removed: Vec<String>,
}

/// What a navigation led to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationOutcome {
    /// Set when the page is an extension's own page and was wired to it.
    pub extension_page: Option<String>,
    /// User scripts newly registered with the page.
    pub injected: usize,
}

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

/// An install that passed validation and now waits for permissions and files.
struct PendingInstall {
    id: String,
    manifest: Manifest,
    source_path: PathBuf,
    install_path: PathBuf,
    source: InstallSource,
    store_id: Option<String>,
}

enum InstallStep {
    /// Already installed; nothing left to do.
    Installed(ExtensionSummary),
    Pending(PendingInstall),
}

enum Command {
    BeginInstall {
        path: PathBuf,
        source: InstallSource,
        store_id: Option<String>,
        reply: Reply<InstallStep>,
    },
    CompleteInstall {
        pending: PendingInstall,
        reply: Reply<ExtensionSummary>,
    },
    AbandonInstall {
        id: String,
    },
    Uninstall {
        id: String,
        reply: Reply<()>,
    },
    SetEnabled {
        id: String,
        enabled: bool,
        reply: Reply<ExtensionSummary>,
    },
    List {
        reply: oneshot::Sender<Vec<ExtensionSummary>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<InstalledExtension>>,
    },
    State {
        id: String,
        reply: oneshot::Sender<Option<ExtensionState>>,
    },
    Startup {
        reply: oneshot::Sender<StartupReport>,
    },
    NavigationCompleted {
        page: PageId,
        url: String,
        frame: FrameKind,
        reply: Reply<NavigationOutcome>,
    },
    PageClosed {
        page: PageId,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        reply: oneshot::Sender<(SubscriptionHandle, mpsc::UnboundedReceiver<ExtensionEvent>)>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the coordinator task.
///
/// Permission prompts and file copies of an install run on the caller's
/// task; only the bookkeeping on either side of them goes through the actor.
#[derive(Clone)]
pub struct ExtensionRuntime {
    commands: mpsc::UnboundedSender<Command>,
    permissions: Arc<PermissionManager>,
}

/// Sends [`Command::AbandonInstall`] unless the install reached the coordinator.
struct AbandonOnDrop {
    commands: mpsc::UnboundedSender<Command>,
    id: Option<String>,
}

impl AbandonOnDrop {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let _ = self.commands.send(Command::AbandonInstall { id });
        }
    }
}

impl ExtensionRuntime {
    /// Spawns the coordinator on the current tokio runtime.
    pub fn spawn(services: RuntimeServices, registry: ExtensionRegistry) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let permissions = Arc::clone(&services.permissions);
        let actor = Coordinator::new(services, registry);
        tokio::spawn(actor.run(rx));
        Self { commands, permissions }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| RuntimeError::ShuttingDown)?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)
    }

    /// Installs an unpacked extension directory.
    pub async fn install(&self, path: impl Into<PathBuf>, source: InstallSource) -> Result<ExtensionSummary, RuntimeError> {
        self.install_from(path.into(), source, None).await
    }

    /// Installs an extracted store package. The store id becomes the extension id.
    pub async fn install_store_package(&self, path: impl Into<PathBuf>, store_id: &str) -> Result<ExtensionSummary, RuntimeError> {
        self.install_from(path.into(), InstallSource::Store, Some(store_id.to_string()))
            .await
    }

    async fn install_from(
        &self,
        path: PathBuf,
        source: InstallSource,
        store_id: Option<String>,
    ) -> Result<ExtensionSummary, RuntimeError> {
        let step = self
            .request(|reply| Command::BeginInstall {
                path,
                source,
                store_id,
                reply,
            })
            .await??;
        let pending = match step {
            InstallStep::Installed(summary) => return Ok(summary),
            InstallStep::Pending(pending) => pending,
        };
        let guard = AbandonOnDrop {
            commands: self.commands.clone(),
            id: Some(pending.id.clone()),
        };

        let declared = pending.manifest.declared_permissions();
        if !declared.is_empty() {
            let outcome = self
                .permissions
                .request(&pending.id, &pending.manifest.name, &declared)
                .await?;
            if outcome == PermissionOutcome::Denied {
                return Err(PermissionError::Denied(pending.manifest.name.clone()).into());
            }
        }
        if pending.source.owns_files() {
            copy_extension(pending.source_path.clone(), pending.install_path.clone()).await?;
        }

        guard.disarm();
        self.request(|reply| Command::CompleteInstall { pending, reply })
            .await?
    }

    /// Removes an extension. Repeating it for the same id is a no-op.
    pub async fn uninstall(&self, id: &str) -> Result<(), RuntimeError> {
        let id = id.to_string();
        self.request(|reply| Command::Uninstall { id, reply }).await?
    }

    pub async fn enable(&self, id: &str) -> Result<ExtensionSummary, RuntimeError> {
        let id = id.to_string();
        self.request(|reply| Command::SetEnabled { id, enabled: true, reply })
            .await?
    }

    pub async fn disable(&self, id: &str) -> Result<ExtensionSummary, RuntimeError> {
        let id = id.to_string();
        self.request(|reply| Command::SetEnabled { id, enabled: false, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<ExtensionSummary>, RuntimeError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<InstalledExtension>, RuntimeError> {
        let id = id.to_string();
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Lifecycle state, including installs still in progress and ids uninstalled during this run.
    pub async fn state(&self, id: &str) -> Result<ExtensionState, RuntimeError> {
        let key = id.to_string();
        self.request(|reply| Command::State { id: key, reply })
            .await?
            .ok_or_else(|| RuntimeError::ExtensionNotFound(id.to_string()))
    }

    /// Reconciles the registry and starts every enabled extension.
    pub async fn startup(&self) -> Result<StartupReport, RuntimeError> {
        self.request(|reply| Command::Startup { reply }).await
    }

    pub async fn navigation_completed(
        &self,
        page: PageId,
        url: &str,
        frame: FrameKind,
    ) -> Result<NavigationOutcome, RuntimeError> {
        let url = url.to_string();
        self.request(|reply| Command::NavigationCompleted { page, url, frame, reply })
            .await?
    }

    pub async fn page_closed(&self, page: PageId) -> Result<(), RuntimeError> {
        self.request(|reply| Command::PageClosed { page, reply }).await
    }

    /// Lifecycle events from now on, until [`ExtensionRuntime::unsubscribe`].
    pub async fn subscribe(&self) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<ExtensionEvent>), RuntimeError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, RuntimeError> {
        self.request(|reply| Command::Unsubscribe { handle, reply }).await
    }

    /// Stops every host and ends the coordinator task.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// In-memory view of an enabled extension.
struct LoadedExtension {
    host: Option<BackgroundHost>,
    content_scripts: usize,
}

struct Coordinator {
    services: RuntimeServices,
    registry: ExtensionRegistry,
    loaded: HashMap<String, LoadedExtension>,
    matcher: ContentScriptMatcher,
    /// Ids uninstalled during this run; a repeated uninstall is a no-op.
    tombstones: HashSet<String>,
    /// Installs between begin and complete, with the directory they copy into.
    installing: HashMap<String, Option<PathBuf>>,
    /// User scripts already registered per page.
    injected: HashMap<PageId, HashSet<(String, usize, String)>>,
    subscribers: ListenerRegistry<mpsc::UnboundedSender<ExtensionEvent>>,
    last_install: i64,
}

impl Coordinator {
    fn new(services: RuntimeServices, registry: ExtensionRegistry) -> Self {
        let last_install = registry.latest_install();
        Self {
            services,
            registry,
            loaded: HashMap::new(),
            matcher: ContentScriptMatcher::new(),
            tombstones: HashSet::new(),
            installing: HashMap::new(),
            injected: HashMap::new(),
            subscribers: ListenerRegistry::new(),
            last_install,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::BeginInstall {
                    path,
                    source,
                    store_id,
                    reply,
                } => {
                    let _ = reply.send(self.begin_install(path, source, store_id).await);
                }
                Command::CompleteInstall { pending, reply } => {
                    let _ = reply.send(self.complete_install(pending).await);
                }
                Command::AbandonInstall { id } => {
                    self.abandon_install(&id).await;
                }
                Command::Uninstall { id, reply } => {
                    let _ = reply.send(self.uninstall(&id).await);
                }
                Command::SetEnabled { id, enabled, reply } => {
                    let _ = reply.send(self.set_enabled(&id, enabled).await);
                }
                Command::List { reply } => {
                    let _ = reply.send(self.list());
                }
                Command::Get { id, reply } => {
                    let _ = reply.send(self.registry.get(&id).cloned());
                }
                Command::State { id, reply } => {
                    let _ = reply.send(self.state(&id));
                }
                Command::Startup { reply } => {
                    let _ = reply.send(self.startup().await);
                }
                Command::NavigationCompleted { page, url, frame, reply } => {
                    let _ = reply.send(self.navigation_completed(page, &url, frame).await);
                }
                Command::PageClosed { page, reply } => {
                    self.page_closed(page).await;
                    let _ = reply.send(());
                }
                Command::Subscribe { reply } => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let handle = self.subscribers.add("runtime", tx);
                    let _ = reply.send((handle, rx));
                }
                Command::Unsubscribe { handle, reply } => {
                    let _ = reply.send(self.subscribers.remove(handle).is_some());
                }
                Command::Shutdown { reply } => {
                    self.stop_all().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!(target: "runtime", "coordinator stopped");
    }

    fn state_of(&self, entry: &InstalledExtension) -> ExtensionState {
        if entry.enabled {
            ExtensionState::Enabled
        } else {
            ExtensionState::Disabled
        }
    }

    fn state(&self, id: &str) -> Option<ExtensionState> {
        if let Some(entry) = self.registry.get(id) {
            Some(self.state_of(entry))
        } else if self.installing.contains_key(id) {
            Some(ExtensionState::Installing)
        } else if self.tombstones.contains(id) {
            Some(ExtensionState::Uninstalled)
        } else {
            None
        }
    }

    fn summary(&self, id: &str) -> Result<ExtensionSummary, RuntimeError> {
        self.registry
            .get(id)
            .map(|entry| entry.summary(self.state_of(entry)))
            .ok_or_else(|| RuntimeError::ExtensionNotFound(id.to_string()))
    }

    fn list(&self) -> Vec<ExtensionSummary> {
        let mut list: Vec<ExtensionSummary> = self
            .registry
            .values()
            .map(|entry| entry.summary(self.state_of(entry)))
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    fn publish(&mut self, event: ExtensionEvent) {
        let mut closed = Vec::new();
        for (handle, _, tx) in self.subscribers.iter() {
            if tx.send(event.clone()).is_err() {
                closed.push(handle);
            }
        }
        for handle in closed {
            self.subscribers.remove(handle);
        }
    }

    fn next_install_timestamp(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        self.last_install = now.max(self.last_install + 1);
        self.last_install
    }

    // ─── Install ───

    async fn begin_install(
        &mut self,
        path: PathBuf,
        source: InstallSource,
        store_id: Option<String>,
    ) -> Result<InstallStep, RuntimeError> {
        let manifest = ManifestParser::parse_path(&path)?;
        let source_path = path
            .canonicalize()
            .map_err(|e| RuntimeError::Io(format!("Cannot resolve {}: {}", path.display(), e)))?;
        let id = match &store_id {
            Some(store_id) => store_id.clone(),
            None => derive_extension_id(&manifest, &source_path),
        };

        if let Some(existing) = self.registry.get(&id).cloned() {
            debug!(target: "runtime", extension_id = %id, "already installed");
            if existing.enabled && !self.loaded.contains_key(&id) {
                self.activate(&existing).await?;
            }
            return self.summary(&id).map(InstallStep::Installed);
        }
        if self.installing.contains_key(&id) {
            return Err(RuntimeError::InstallInProgress(id));
        }
        info!(target: "runtime", extension_id = %id, name = %manifest.name, version = %manifest.version, ?source, "installing extension");

        let install_path = if source.owns_files() {
            self.services.config.extensions_dir().join(&id)
        } else {
            source_path.clone()
        };
        self.installing
            .insert(id.clone(), source.owns_files().then(|| install_path.clone()));
        Ok(InstallStep::Pending(PendingInstall {
            id,
            manifest,
            source_path,
            install_path,
            source,
            store_id,
        }))
    }

    async fn abandon_install(&mut self, id: &str) {
        if let Some(owned) = self.installing.remove(id) {
            debug!(target: "runtime", extension_id = id, "install abandoned");
            self.rollback(id, owned.as_deref()).await;
        }
    }

    async fn complete_install(&mut self, pending: PendingInstall) -> Result<ExtensionSummary, RuntimeError> {
        let PendingInstall {
            id,
            manifest,
            install_path,
            source,
            store_id,
            ..
        } = pending;
        self.installing.remove(&id);
        self.tombstones.remove(&id);
        let owned = source.owns_files().then(|| install_path.clone());

        let entry = InstalledExtension {
            id: id.clone(),
            manifest,
            install_path,
            installed_at: self.next_install_timestamp(),
            last_used_at: None,
            enabled: true,
            source,
            store_id,
        };

        if let Err(e) = self.activate(&entry).await {
            self.rollback(&id, owned.as_deref()).await;
            return Err(e);
        }

        self.registry.insert(entry);
        if let Err(e) = self.registry.save() {
            self.registry.remove(&id);
            self.deactivate(&id).await;
            self.rollback(&id, owned.as_deref()).await;
            return Err(e);
        }

        if let Some(host) = self.host_handle(&id) {
            let _ = host.dispatch_event("runtime.onInstalled", vec![json!({ "reason": InstallReason::Install })]);
        }
        self.publish(ExtensionEvent::Installed {
            extension_id: id.clone(),
        });
        info!(target: "runtime", extension_id = %id, "extension installed");
        self.summary(&id)
    }

    async fn rollback(&mut self, id: &str, owned_files: Option<&Path>) {
        warn!(target: "runtime", extension_id = id, "rolling back install");
        if let Err(e) = self.services.permissions.remove_all(id) {
            error!(target: "runtime", extension_id = id, error = %e, "could not revoke grants during rollback");
        }
        if let Some(path) = owned_files {
            if let Err(e) = delete_extension_files(path.to_path_buf()).await {
                error!(target: "runtime", extension_id = id, error = %e, "could not delete files during rollback");
            }
        }
    }

    // ─── Loading ───

    fn host_handle(&self, id: &str) -> Option<HostHandle> {
        self.loaded
            .get(id)
            .and_then(|loaded| loaded.host.as_ref())
            .map(BackgroundHost::handle)
    }

    async fn activate(&mut self, entry: &InstalledExtension) -> Result<(), RuntimeError> {
        let id = entry.id.clone();
        let router = Arc::clone(&self.services.router);

        let host = if entry.manifest.background.is_some() {
            let spec = HostSpec {
                extension_id: id.clone(),
                manifest: entry.manifest.clone(),
                install_path: entry.install_path.clone(),
                origin: self.services.config.extension_origin(&id),
                memory_limit: self.services.config.script_memory_limit_bytes,
                quotas: self.services.config.quotas,
                script_timeout: self.services.config.script_timeout(),
            };
            let attach_id = id.clone();
            let name = entry.manifest.name.clone();
            let manifest = entry.manifest.clone();
            let attach_router = Arc::clone(&router);
            let spawned = BackgroundHost::spawn_with(spec, self.services.outbound.clone(), move |handle| {
                attach_router.attach_extension(&attach_id, &name, manifest, Some(handle));
            })
            .await;
            match spawned {
                Ok(host) => Some(host),
                Err(e) => {
                    router.detach_extension(&id).await;
                    return Err(e.into());
                }
            }
        } else {
            router.attach_extension(&id, &entry.manifest.name, entry.manifest.clone(), None);
            None
        };

        let content_scripts = match self
            .matcher
            .register(&id, &entry.install_path, &entry.manifest.content_scripts)
        {
            Ok(count) => count,
            Err(e) => {
                if let Some(host) = host {
                    host.shutdown().await;
                }
                router.detach_extension(&id).await;
                return Err(e);
            }
        };

        debug!(target: "runtime", extension_id = %id, content_scripts, background = host.is_some(), "extension loaded");
        self.loaded.insert(id, LoadedExtension { host, content_scripts });
        Ok(())
    }

    async fn deactivate(&mut self, id: &str) {
        if let Some(loaded) = self.loaded.remove(id) {
            if let Some(host) = loaded.host {
                host.shutdown().await;
            }
            debug!(target: "runtime", extension_id = id, content_scripts = loaded.content_scripts, "extension unloaded");
        }
        self.matcher.unregister(id);
        for scripts in self.injected.values_mut() {
            scripts.retain(|(owner, _, _)| owner != id);
        }
        self.services.router.detach_extension(id).await;
    }

    async fn stop_all(&mut self) {
        let ids: Vec<String> = self.loaded.keys().cloned().collect();
        for id in ids {
            self.deactivate(&id).await;
        }
    }

    // ─── Uninstall / enable / disable ───

    async fn uninstall(&mut self, id: &str) -> Result<(), RuntimeError> {
        let Some(entry) = self.registry.get(id).cloned() else {
            if self.tombstones.contains(id) {
                debug!(target: "runtime", extension_id = id, "already uninstalled");
                return Ok(());
            }
            return Err(RuntimeError::ExtensionNotFound(id.to_string()));
        };

        self.deactivate(id).await;
        self.services.permissions.remove_all(id)?;
        self.services.storage.clear_extension(id)?;
        if entry.source.owns_files() {
            delete_extension_files(entry.install_path.clone()).await?;
        }
        self.registry.remove(id);
        self.registry.save()?;
        self.tombstones.insert(id.to_string());

        self.publish(ExtensionEvent::Uninstalled {
            extension_id: id.to_string(),
        });
        info!(target: "runtime", extension_id = id, "extension uninstalled");
        Ok(())
    }

    async fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<ExtensionSummary, RuntimeError> {
        let entry = self
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::ExtensionNotFound(id.to_string()))?;
        if entry.enabled == enabled {
            return self.summary(id);
        }

        if enabled {
            self.activate(&entry).await?;
        } else {
            self.deactivate(id).await;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        if let Some(stored) = self.registry.get_mut(id) {
            stored.enabled = enabled;
            stored.last_used_at = Some(now);
        }
        self.registry.save()?;

        let event = if enabled {
            ExtensionEvent::Enabled {
                extension_id: id.to_string(),
            }
        } else {
            ExtensionEvent::Disabled {
                extension_id: id.to_string(),
            }
        };
        self.publish(event);
        info!(target: "runtime", extension_id = id, enabled, "extension state changed");
        self.summary(id)
    }

    // ─── Startup ───

    async fn startup(&mut self) -> StartupReport {
        let mut report = StartupReport::default();
        let mut changed = false;
        let mut updated: HashMap<String, String> = HashMap::new();

        let dropped = self.registry.reconcile_duplicates();
        let kept: BTreeSet<PathBuf> = self.registry.values().map(|e| e.install_path.clone()).collect();
        for entry in dropped {
            changed = true;
            self.forget(&entry, !kept.contains(&entry.install_path)).await;
            report.removed.push(entry.id);
        }

        for id in self.registry.ids() {
            let Some(entry) = self.registry.get(&id).cloned() else {
                continue;
            };
            match ManifestParser::parse_path(&entry.install_path) {
                Ok(manifest) => {
                    if manifest != entry.manifest {
                        if manifest.version != entry.manifest.version {
                            info!(target: "runtime", extension_id = %id, from = %entry.manifest.version, to = %manifest.version, "extension updated on disk");
                            updated.insert(id.clone(), entry.manifest.version.clone());
                        }
                        if let Some(stored) = self.registry.get_mut(&id) {
                            stored.manifest = manifest;
                            changed = true;
                        }
                    }
                }
                Err(ManifestError::Io(reason)) => {
                    warn!(target: "runtime", extension_id = %id, path = %entry.install_path.display(), %reason, "extension files missing; removing entry");
                    self.registry.remove(&id);
                    self.forget(&entry, false).await;
                    report.removed.push(id);
                    changed = true;
                }
                Err(e) => {
                    error!(target: "runtime", extension_id = %id, error = %e, "manifest no longer valid; not starting");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        let enabled: Vec<InstalledExtension> = self
            .registry
            .values()
            .filter(|e| e.enabled && !self.loaded.contains_key(&e.id))
            .filter(|e| !report.failed.iter().any(|(id, _)| id == &e.id))
            .cloned()
            .collect();
        for entry in enabled {
            match self.activate(&entry).await {
                Ok(()) => report.started.push(entry.id.clone()),
                Err(e) if is_missing_file(&e) => {
                    warn!(target: "runtime", extension_id = %entry.id, error = %e, "extension files missing; removing entry");
                    self.registry.remove(&entry.id);
                    self.forget(&entry, true).await;
                    report.removed.push(entry.id.clone());
                    changed = true;
                }
                Err(e) => {
                    error!(target: "runtime", extension_id = %entry.id, error = %e, "extension failed to start");
                    report.failed.push((entry.id.clone(), e.to_string()));
                }
            }
        }

        for id in &report.started {
            if let Some(host) = self.host_handle(id) {
                if let Some(previous) = updated.get(id) {
                    let details = json!({ "reason": InstallReason::Update, "previousVersion": previous });
                    let _ = host.dispatch_event("runtime.onInstalled", vec![details]);
                }
                let _ = host.dispatch_event("runtime.onStartup", Vec::new());
            }
        }

        if changed {
            if let Err(e) = self.registry.save() {
                error!(target: "runtime", error = %e, "could not save reconciled registry");
            }
        }
        debug!(target: "runtime", started = report.started.len(), failed = report.failed.len(), removed = report.removed.len(), "startup finished");
        report
    }

    /// Drops grants, storage and (optionally) files of an entry that is no longer in the registry.
    async fn forget(&mut self, entry: &InstalledExtension, delete_files: bool) {
        self.deactivate(&entry.id).await;
        if let Err(e) = self.services.permissions.remove_all(&entry.id) {
            warn!(target: "runtime", extension_id = %entry.id, error = %e, "could not revoke grants");
        }
        if let Err(e) = self.services.storage.clear_extension(&entry.id) {
            warn!(target: "runtime", extension_id = %entry.id, error = %e, "could not clear storage");
        }
        if delete_files && entry.source.owns_files() {
            if let Err(e) = delete_extension_files(entry.install_path.clone()).await {
                warn!(target: "runtime", extension_id = %entry.id, error = %e, "could not delete files");
            }
        }
    }

    // ─── Navigation ───

    async fn navigation_completed(
        &mut self,
        page: PageId,
        url: &str,
        frame: FrameKind,
    ) -> Result<NavigationOutcome, RuntimeError> {
        let mut outcome = NavigationOutcome::default();
        let router = Arc::clone(&self.services.router);

        if frame == FrameKind::Top {
            let wired = router
                .wire_page(page, url)
                .await
                .map_err(|e| RuntimeError::InstallationFailed(format!("cannot wire page {}: {}", page, e)))?;
            if wired {
                outcome.extension_page = self.services.config.extension_id_of(url).map(str::to_string);
            } else {
                router.unwire_page(page);
            }
        }

        if outcome.extension_page.is_none() {
            let plan = self.matcher.plan(url, frame);
            let seen = self.injected.entry(page).or_default();
            let mut scripts = Vec::new();
            for injection in plan {
                let key = (injection.extension_id.clone(), injection.descriptor_index, injection.file.clone());
                if !seen.insert(key) {
                    continue;
                }
                let descriptor = self
                    .registry
                    .get(&injection.extension_id)
                    .and_then(|e| e.manifest.content_scripts.get(injection.descriptor_index).cloned());
                let (matches, exclude_matches) = descriptor
                    .map(|d| (d.matches, d.exclude_matches))
                    .unwrap_or_default();
                scripts.push(UserScript {
                    extension_id: injection.extension_id,
                    file: injection.file,
                    source: injection.source,
                    timing: injection.timing,
                    all_frames: injection.all_frames,
                    matches,
                    exclude_matches,
                });
            }
            for script in scripts {
                let extension_id = script.extension_id.clone();
                match self.services.renderer.add_user_script(page, script).await {
                    Ok(()) => outcome.injected += 1,
                    Err(e) => warn!(target: "runtime", extension_id = %extension_id, page, error = %e, "user script not registered"),
                }
            }
        }

        if frame == FrameKind::Top {
            self.broadcast_navigation(page, url).await;
        }
        Ok(outcome)
    }

    async fn broadcast_navigation(&self, page: PageId, url: &str) {
        let permissions = &self.services.permissions;
        for id in self.loaded.keys() {
            let can_see_url = permissions.has("tabs", id).unwrap_or(false) || permissions.allows_url(id, url).unwrap_or(false);
            let mut tab = json!({ "id": page, "status": "complete" });
            let mut change = json!({ "status": "complete" });
            if can_see_url {
                tab["url"] = Value::String(url.to_string());
                change["url"] = Value::String(url.to_string());
            }
            self.services
                .router
                .emit(id, "tabs.onUpdated", vec![json!(page), change, tab])
                .await;
            if permissions.has("webNavigation", id).unwrap_or(false) {
                self.services
                    .router
                    .emit(
                        id,
                        "webNavigation.onCompleted",
                        vec![json!({ "tabId": page, "url": url, "frameId": 0 })],
                    )
                    .await;
            }
        }
    }

    async fn page_closed(&mut self, page: PageId) {
        self.services.router.unwire_page(page);
        self.injected.remove(&page);
        for id in self.loaded.keys() {
            self.services
                .router
                .emit(id, "tabs.onRemoved", vec![json!(page), json!({ "isWindowClosing": false })])
                .await;
        }
    }
}

/// Errors meaning part of the extension is gone from disk.
fn is_missing_file(error: &RuntimeError) -> bool {
    matches!(
        error,
        RuntimeError::MissingFile { .. }
            | RuntimeError::BackgroundScript(BackgroundScriptError::MissingEntryPoint { .. })
    )
}

async fn copy_extension(from: PathBuf, to: PathBuf) -> Result<u64, RuntimeError> {
    tokio::task::spawn_blocking(move || {
        remove_dir_if_exists(&to)?;
        copy_dir_all(&from, &to)
    })
    .await
    .map_err(|e| RuntimeError::Io(e.to_string()))?
    .map_err(|e| RuntimeError::Io(format!("Failed to copy extension files: {}", e)))
}

async fn delete_extension_files(path: PathBuf) -> Result<(), RuntimeError> {
    tokio::task::spawn_blocking(move || remove_dir_if_exists(&path))
        .await
        .map_err(|e| RuntimeError::Io(e.to_string()))?
        .map_err(|e| RuntimeError::Io(format!("Failed to delete extension files: {}", e)))
}
