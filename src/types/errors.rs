use thiserror::Error;

// === ManifestError ===

/// Errors raised while parsing or validating an extension manifest.
///
/// Always fatal to the install or load attempt that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// `manifest_version` is present but not the integer 2 or 3. Holds the value as written.
    #[error("Unsupported manifest version: {0}")]
    UnsupportedVersion(String),
    /// A required field is absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(String),
    /// The `version` string is not 1-4 dot-separated integers.
    #[error("Invalid version format: {0}")]
    InvalidVersionFormat(String),
    /// A host permission or match pattern does not follow the pattern grammar.
    #[error("Invalid host pattern: {0}")]
    InvalidHostPattern(String),
    /// A content script entry violates its invariants.
    #[error("Invalid content script: {0}")]
    InvalidContentScript(String),
    /// Manifest v3 declared background scripts or a background page.
    #[error("Persistent background scripts are not allowed in manifest v3")]
    PersistentBackgroundNotAllowed,
    /// The document is not valid JSON or has the wrong shape.
    #[error("Manifest parse error: {0}")]
    Parse(String),
    /// The manifest file could not be read.
    #[error("Cannot read manifest: {0}")]
    Io(String),
}

// === PermissionError ===

/// Errors related to extension permission management.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    /// The host UI (or policy) refused the requested permissions.
    #[error("Permission denied for extension: {0}")]
    Denied(String),
    /// Database operation failed.
    #[error("Permission database error: {0}")]
    Database(String),
    /// The host UI could not be reached.
    #[error("Permission prompt failed: {0}")]
    Prompt(String),
}

// === StorageError ===

/// Errors returned to extension scripts by the storage areas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Writing would push the area past its quota. Nothing was written.
    #[error("QUOTA_BYTES quota exceeded in storage.{area}: {requested} > {quota} bytes")]
    QuotaExceeded {
        area: String,
        requested: usize,
        quota: usize,
    },
    /// Database operation failed.
    #[error("Storage database error: {0}")]
    Database(String),
    /// A stored value could not be (de)serialized.
    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

// === BackgroundScriptError ===

/// Errors raised by a background script host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackgroundScriptError {
    /// A declared background file does not exist in the extension directory.
    #[error("Missing background entry point for {extension_id}: {file}")]
    MissingEntryPoint { extension_id: String, file: String },
    /// A background script threw while being evaluated.
    #[error("Background script failed for {extension_id} in {file}: {message}")]
    ExecutionFailed {
        extension_id: String,
        file: String,
        message: String,
        stack: Option<String>,
    },
    /// A script ran past the evaluation time limit and was interrupted.
    #[error("Background script for {extension_id} in {file} exceeded its time limit")]
    TimedOut { extension_id: String, file: String },
    /// The script engine could not be created.
    #[error("Script engine unavailable: {0}")]
    EngineUnavailable(String),
    /// The host thread is gone.
    #[error("Background host stopped: {0}")]
    Stopped(String),
}

// === HostError ===

/// Errors reported by the external collaborators (page renderer, tabs, host UI).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The collaborator is not connected.
    #[error("Host unavailable: {0}")]
    Unavailable(String),
    /// The collaborator refused or failed the operation.
    #[error("Host rejected request: {0}")]
    Rejected(String),
    /// Tab or page with the given id does not exist.
    #[error("No tab with id: {0}")]
    NoSuchTab(i64),
    /// The collaborator did not answer in time.
    #[error("Host request timed out")]
    Timeout,
}

// === ApiError ===

/// Errors surfaced to extension code through `chrome.runtime.lastError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The method name is not part of the API surface.
    #[error("Unknown API method: {0}")]
    UnknownMethod(String),
    /// The arguments do not match the method's documented shape.
    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },
    /// The extension has not been granted the permission the method needs.
    #[error("Missing permission: {0}")]
    PermissionRequired(String),
    /// No context is listening for a message.
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,
    /// The call was not answered before its deadline.
    #[error("The call timed out")]
    Timeout,
    /// Storage area failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Collaborator failure.
    #[error(transparent)]
    Host(#[from] HostError),
    /// Permission bookkeeping failure.
    #[error(transparent)]
    Permission(#[from] PermissionError),
}

// === RuntimeError ===

/// Errors related to the extension runtime coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Extension with the given ID is not installed.
    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),
    /// A file the extension needs is missing from its install directory.
    #[error("Missing file for extension {extension_id}: {path}")]
    MissingFile { extension_id: String, path: String },
    /// Installation could not be completed.
    #[error("Extension installation failed: {0}")]
    InstallationFailed(String),
    /// Another install of the same extension id is running.
    #[error("Extension installation already in progress: {0}")]
    InstallInProgress(String),
    /// The registry file could not be read or written.
    #[error("Extension registry error: {0}")]
    Registry(String),
    /// Store package could not be downloaded or extracted.
    #[error("Extension download failed: {0}")]
    Download(String),
    /// File system error while copying or deleting extension files.
    #[error("Extension file system error: {0}")]
    Io(String),
    /// The coordinator task has shut down.
    #[error("Extension runtime is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    BackgroundScript(#[from] BackgroundScriptError),
}

// === ConfigError ===

/// Errors related to runtime configuration loading and saving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An I/O error occurred while reading or writing the config file.
    #[error("Config I/O error: {0}")]
    Io(String),
    /// The config file is malformed.
    #[error("Config serialization error: {0}")]
    Serialization(String),
}
