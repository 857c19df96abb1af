//! Manifest parsing and validation.
//!
//! Turns a `manifest.json` document into a validated [`Manifest`]. Deprecated
//! v2 constructs inside a v3 manifest are reported as warnings and tolerated;
//! everything else that breaks an invariant is a [`ManifestError`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::types::errors::ManifestError;
use crate::types::manifest::{
    ActionDescriptor, BackgroundDescriptor, ContentScriptDescriptor, Manifest, ManifestVersion,
    OptionsPageDescriptor, RunAt,
};
use crate::types::permission::is_host_pattern;

pub const MANIFEST_FILE: &str = "manifest.json";

const ALLOWED_SCHEMES: &[&str] = &["*", "http", "https", "ws", "wss", "ftp", "file", "chrome-extension"];

/// A tolerated problem found while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest_version: Option<Value>,
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    optional_permissions: Vec<String>,
    #[serde(default)]
    host_permissions: Vec<String>,
    background: Option<RawBackground>,
    #[serde(default)]
    content_scripts: Vec<RawContentScript>,
    action: Option<ActionDescriptor>,
    browser_action: Option<ActionDescriptor>,
    page_action: Option<ActionDescriptor>,
    options_page: Option<String>,
    options_ui: Option<RawOptionsUi>,
    content_security_policy: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawBackground {
    scripts: Option<Vec<String>>,
    page: Option<String>,
    service_worker: Option<String>,
    persistent: Option<bool>,
    #[serde(rename = "type")]
    module_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawContentScript {
    #[serde(default)]
    matches: Vec<String>,
    #[serde(default)]
    exclude_matches: Vec<String>,
    #[serde(default)]
    js: Vec<String>,
    #[serde(default)]
    css: Vec<String>,
    run_at: Option<String>,
    #[serde(default)]
    all_frames: bool,
}

#[derive(Debug, Deserialize)]
struct RawOptionsUi {
    page: String,
    #[serde(default)]
    open_in_tab: bool,
}

/// Stateless manifest parser.
pub struct ManifestParser;

impl ManifestParser {
    pub fn parse_bytes(bytes: &[u8]) -> Result<Manifest, ManifestError> {
        Self::parse_with_warnings(bytes).map(|(manifest, _)| manifest)
    }

    /// Reads `manifest.json` from `path`, which may be the file itself or its directory.
    pub fn parse_path(path: &Path) -> Result<Manifest, ManifestError> {
        let file = if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        };
        let bytes = std::fs::read(&file)
            .map_err(|e| ManifestError::Io(format!("{}: {}", file.display(), e)))?;
        Self::parse_bytes(&bytes)
    }

    pub fn parse_with_warnings(bytes: &[u8]) -> Result<(Manifest, Vec<ManifestWarning>), ManifestError> {
        let raw: RawManifest =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;
        let mut warnings = Vec::new();

        let manifest_version = parse_manifest_version(raw.manifest_version.as_ref())?;
        let v3 = manifest_version == ManifestVersion::V3;

        let name = required(raw.name, "name")?;
        let version = required(raw.version, "version")?;
        if !is_valid_version(&version) {
            return Err(ManifestError::InvalidVersionFormat(version));
        }

        let mut permissions = BTreeSet::new();
        let mut host_permissions = BTreeSet::new();
        for permission in raw.permissions {
            if is_host_pattern(&permission) {
                if v3 {
                    push_warning(
                        &mut warnings,
                        "permissions",
                        format!("host pattern {} belongs in host_permissions under manifest v3", permission),
                    );
                }
                validate_host_pattern(&permission)?;
                host_permissions.insert(permission);
            } else {
                permissions.insert(permission);
            }
        }
        for pattern in raw.host_permissions {
            validate_host_pattern(&pattern)?;
            host_permissions.insert(pattern);
        }
        let mut optional_permissions = BTreeSet::new();
        for permission in raw.optional_permissions {
            if is_host_pattern(&permission) {
                validate_host_pattern(&permission)?;
            }
            optional_permissions.insert(permission);
        }

        let background = match raw.background {
            Some(bg) => parse_background(bg, v3, &mut warnings)?,
            None => None,
        };

        let content_scripts = raw
            .content_scripts
            .into_iter()
            .enumerate()
            .map(|(index, cs)| parse_content_script(index, cs))
            .collect::<Result<Vec<_>, _>>()?;

        let action = match (raw.action, raw.browser_action, raw.page_action) {
            (Some(action), _, _) => Some(action),
            (None, Some(legacy), _) => {
                if v3 {
                    push_warning(&mut warnings, "browser_action", "replaced by action in manifest v3".to_string());
                }
                Some(legacy)
            }
            (None, None, Some(legacy)) => {
                if v3 {
                    push_warning(&mut warnings, "page_action", "replaced by action in manifest v3".to_string());
                }
                Some(legacy)
            }
            (None, None, None) => None,
        };

        let options_page = match (raw.options_ui, raw.options_page) {
            (Some(ui), _) => Some(OptionsPageDescriptor {
                page: ui.page,
                open_in_tab: ui.open_in_tab,
            }),
            (None, Some(page)) => Some(OptionsPageDescriptor {
                page,
                open_in_tab: true,
            }),
            (None, None) => None,
        };

        if v3 && matches!(raw.content_security_policy, Some(Value::String(_))) {
            push_warning(
                &mut warnings,
                "content_security_policy",
                "string form is not supported in manifest v3; use an object".to_string(),
            );
        }

        let manifest = Manifest {
            manifest_version,
            name,
            version,
            description: raw.description,
            permissions,
            optional_permissions,
            host_permissions,
            background,
            content_scripts,
            action,
            options_page,
        };
        Ok((manifest, warnings))
    }
}

/// Checks `pattern` against the host permission grammar.
pub fn validate_host_pattern(pattern: &str) -> Result<(), ManifestError> {
    let invalid = || ManifestError::InvalidHostPattern(pattern.to_string());
    if pattern == "<all_urls>" {
        return Ok(());
    }
    let (scheme, rest) = pattern.split_once("://").ok_or_else(invalid)?;
    if !ALLOWED_SCHEMES.contains(&scheme) {
        return Err(invalid());
    }
    let slash = rest.find('/').ok_or_else(invalid)?;
    let (host, _path) = rest.split_at(slash);

    if host.is_empty() {
        return if scheme == "file" { Ok(()) } else { Err(invalid()) };
    }
    if host == "*" {
        return Ok(());
    }
    let literal = host.strip_prefix("*.").unwrap_or(host);
    if literal.is_empty() || literal.contains('*') {
        return Err(invalid());
    }
    Ok(())
}

fn version_regex() -> Option<&'static Regex> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    VERSION
        .get_or_init(|| Regex::new(r"^\d+(\.\d+){0,3}$").ok())
        .as_ref()
}

/// 1-4 dot-separated groups of digits.
pub fn is_valid_version(version: &str) -> bool {
    version_regex().map(|re| re.is_match(version)).unwrap_or(false)
}

fn parse_manifest_version(raw: Option<&Value>) -> Result<ManifestVersion, ManifestError> {
    let value = raw
        .filter(|v| !v.is_null())
        .ok_or_else(|| ManifestError::MissingField("manifest_version".to_string()))?;
    // Only the integers 2 and 3; `3.0`, `"3"` and out-of-range numbers are unsupported
    match value.as_u64() {
        Some(2) => Ok(ManifestVersion::V2),
        Some(3) => Ok(ManifestVersion::V3),
        _ => Err(ManifestError::UnsupportedVersion(value.to_string())),
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ManifestError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ManifestError::MissingField(field.to_string())),
    }
}

fn parse_background(
    bg: RawBackground,
    v3: bool,
    warnings: &mut Vec<ManifestWarning>,
) -> Result<Option<BackgroundDescriptor>, ManifestError> {
    if v3 {
        if bg.scripts.is_some() || bg.page.is_some() {
            return Err(ManifestError::PersistentBackgroundNotAllowed);
        }
        if bg.persistent.is_some() {
            push_warning(warnings, "background.persistent", "ignored in manifest v3".to_string());
        }
        return Ok(bg.service_worker.map(|service_worker| BackgroundDescriptor::ServiceWorker {
            service_worker,
            module: bg.module_type.as_deref() == Some("module"),
        }));
    }

    let persistent = bg.persistent.unwrap_or(true);
    if let Some(scripts) = bg.scripts {
        if scripts.is_empty() {
            return Err(ManifestError::MissingField("background.scripts".to_string()));
        }
        return Ok(Some(BackgroundDescriptor::Scripts { scripts, persistent }));
    }
    if let Some(page) = bg.page {
        return Ok(Some(BackgroundDescriptor::Page { page, persistent }));
    }
    if bg.service_worker.is_some() {
        push_warning(warnings, "background.service_worker", "requires manifest v3; ignored".to_string());
    }
    Ok(None)
}

fn parse_content_script(index: usize, raw: RawContentScript) -> Result<ContentScriptDescriptor, ManifestError> {
    if raw.matches.is_empty() {
        return Err(ManifestError::InvalidContentScript(format!(
            "content_scripts[{}].matches must not be empty",
            index
        )));
    }
    for pattern in raw.matches.iter().chain(raw.exclude_matches.iter()) {
        validate_host_pattern(pattern)?;
    }
    if raw.js.is_empty() && raw.css.is_empty() {
        return Err(ManifestError::InvalidContentScript(format!(
            "content_scripts[{}] needs at least one js or css file",
            index
        )));
    }
    let run_at = match raw.run_at.as_deref() {
        None | Some("document_idle") => RunAt::DocumentIdle,
        Some("document_start") => RunAt::DocumentStart,
        Some("document_end") => RunAt::DocumentEnd,
        Some(other) => {
            return Err(ManifestError::InvalidContentScript(format!(
                "content_scripts[{}].run_at has unknown value {}",
                index, other
            )))
        }
    };
    Ok(ContentScriptDescriptor {
        matches: raw.matches,
        exclude_matches: raw.exclude_matches,
        js: raw.js,
        css: raw.css,
        run_at,
        all_frames: raw.all_frames,
    })
}

fn push_warning(warnings: &mut Vec<ManifestWarning>, field: &str, message: String) {
    warn!(target: "manifest", field, "{}", message);
    warnings.push(ManifestWarning {
        field: field.to_string(),
        message,
    });
}
