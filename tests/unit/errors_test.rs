use extension_host::types::errors::*;

// === ManifestError Tests ===

#[test]
fn manifest_error_display_variants() {
    assert_eq!(
        ManifestError::UnsupportedVersion("4".to_string()).to_string(),
        "Unsupported manifest version: 4"
    );
    assert_eq!(
        ManifestError::MissingField("name".to_string()).to_string(),
        "Missing required field: name"
    );
    assert_eq!(
        ManifestError::InvalidVersionFormat("1.x".to_string()).to_string(),
        "Invalid version format: 1.x"
    );
    assert_eq!(
        ManifestError::InvalidHostPattern("example.com".to_string()).to_string(),
        "Invalid host pattern: example.com"
    );
    assert_eq!(
        ManifestError::PersistentBackgroundNotAllowed.to_string(),
        "Persistent background scripts are not allowed in manifest v3"
    );
}

#[test]
fn manifest_error_implements_error_trait() {
    let err: Box<dyn std::error::Error> = Box::new(ManifestError::Parse("eof".to_string()));
    assert!(err.source().is_none());
}

// === PermissionError Tests ===

#[test]
fn permission_error_display_variants() {
    assert_eq!(
        PermissionError::Denied("Ad Blocker".to_string()).to_string(),
        "Permission denied for extension: Ad Blocker"
    );
    assert_eq!(
        PermissionError::Database("locked".to_string()).to_string(),
        "Permission database error: locked"
    );
    assert_eq!(
        PermissionError::Prompt("offline".to_string()).to_string(),
        "Permission prompt failed: offline"
    );
}

// === StorageError Tests ===

#[test]
fn storage_error_quota_display_names_area_and_sizes() {
    let err = StorageError::QuotaExceeded {
        area: "sync".to_string(),
        requested: 102_500,
        quota: 102_400,
    };
    assert_eq!(
        err.to_string(),
        "QUOTA_BYTES quota exceeded in storage.sync: 102500 > 102400 bytes"
    );
}

// === BackgroundScriptError Tests ===

#[test]
fn background_error_display_variants() {
    let missing = BackgroundScriptError::MissingEntryPoint {
        extension_id: "abc".to_string(),
        file: "bg.js".to_string(),
    };
    assert_eq!(missing.to_string(), "Missing background entry point for abc: bg.js");

    let failed = BackgroundScriptError::ExecutionFailed {
        extension_id: "abc".to_string(),
        file: "bg.js".to_string(),
        message: "boom".to_string(),
        stack: Some("at bg.js:1".to_string()),
    };
    assert_eq!(failed.to_string(), "Background script failed for abc in bg.js: boom");
}

// === ApiError Tests ===

#[test]
fn api_error_no_receiver_matches_chrome_message() {
    assert_eq!(
        ApiError::NoReceiver.to_string(),
        "Could not establish connection. Receiving end does not exist."
    );
}

#[test]
fn api_error_wraps_storage_errors_transparently() {
    let inner = StorageError::Serialization("bad".to_string());
    let err: ApiError = inner.clone().into();
    assert_eq!(err.to_string(), inner.to_string());
}

#[test]
fn api_error_wraps_host_errors() {
    let err: ApiError = HostError::NoSuchTab(7).into();
    assert_eq!(err, ApiError::Host(HostError::NoSuchTab(7)));
    assert_eq!(err.to_string(), "No tab with id: 7");
}

// === RuntimeError Tests ===

#[test]
fn runtime_error_display_variants() {
    assert_eq!(
        RuntimeError::ExtensionNotFound("abc".to_string()).to_string(),
        "Extension not found: abc"
    );
    assert_eq!(
        RuntimeError::Download("all mirrors failed".to_string()).to_string(),
        "Extension download failed: all mirrors failed"
    );
    assert_eq!(RuntimeError::ShuttingDown.to_string(), "Extension runtime is shutting down");
}

#[test]
fn runtime_error_from_manifest_error() {
    let err: RuntimeError = ManifestError::MissingField("version".to_string()).into();
    assert!(matches!(err, RuntimeError::Manifest(ManifestError::MissingField(_))));
    assert_eq!(err.to_string(), "Missing required field: version");
}

#[test]
fn runtime_error_from_permission_error() {
    let err: RuntimeError = PermissionError::Denied("X".to_string()).into();
    assert!(matches!(err, RuntimeError::Permission(PermissionError::Denied(_))));
}

#[test]
fn runtime_error_from_background_error() {
    let err: RuntimeError = BackgroundScriptError::Stopped("abc".to_string()).into();
    assert_eq!(err.to_string(), "Background host stopped: abc");
}

// === ConfigError Tests ===

#[test]
fn config_error_display_variants() {
    assert_eq!(
        ConfigError::Io("permission denied".to_string()).to_string(),
        "Config I/O error: permission denied"
    );
    assert_eq!(
        ConfigError::Serialization("expected value".to_string()).to_string(),
        "Config serialization error: expected value"
    );
}
