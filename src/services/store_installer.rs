//! Store package installer.
//!
//! Downloads a package by store id from the configured mirrors, strips the
//! CRX envelope, extracts the zip into a staging directory and hands the
//! result to the runtime coordinator.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::services::extension_files::remove_dir_if_exists;
use crate::services::extension_runtime::ExtensionRuntime;
use crate::types::config::RuntimeConfig;
use crate::types::errors::RuntimeError;
use crate::types::extension::ExtensionSummary;

/// CRX magic number, `Cr24`.
pub const CRX_MAGIC: [u8; 4] = *b"Cr24";
/// Zip local file header signature.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

const STORE_ID_LEN: usize = 32;

fn download_err(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Download(message.into())
}

/// Store ids are 32 characters from `a` to `p`.
pub fn is_valid_store_id(id: &str) -> bool {
    id.len() == STORE_ID_LEN && id.bytes().all(|b| (b'a'..=b'p').contains(&b))
}

/// Expands every mirror template for `store_id`. Templates that do not form a valid URL are skipped.
pub fn mirror_urls(templates: &[String], store_id: &str) -> Vec<Url> {
    templates
        .iter()
        .filter_map(|template| {
            let raw = template.replace("{id}", store_id);
            match Url::parse(&raw) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
                Ok(url) => {
                    warn!(target: "store", scheme = url.scheme(), "mirror skipped: unsupported scheme");
                    None
                }
                Err(e) => {
                    warn!(target: "store", template = %template, error = %e, "mirror skipped: invalid url");
                    None
                }
            }
        })
        .collect()
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// Returns the zip payload of a package.
///
/// Accepts CRX3 (`Cr24`, version 3, header length), CRX2 (`Cr24`, version 2,
/// key length, signature length) and bare zip archives.
pub fn strip_crx_header(bytes: &[u8]) -> Result<&[u8], RuntimeError> {
    if bytes.starts_with(&ZIP_MAGIC) {
        return Ok(bytes);
    }
    if !bytes.starts_with(&CRX_MAGIC) {
        return Err(download_err("Package is neither a CRX nor a zip archive"));
    }
    let version = read_u32_le(bytes, 4).ok_or_else(|| download_err("Truncated CRX header"))?;
    let offset = match version {
        3 => {
            let header_len = read_u32_le(bytes, 8).ok_or_else(|| download_err("Truncated CRX header"))?;
            12usize.checked_add(header_len as usize)
        }
        2 => {
            let key_len = read_u32_le(bytes, 8).ok_or_else(|| download_err("Truncated CRX header"))?;
            let sig_len = read_u32_le(bytes, 12).ok_or_else(|| download_err("Truncated CRX header"))?;
            16usize
                .checked_add(key_len as usize)
                .and_then(|n| n.checked_add(sig_len as usize))
        }
        other => return Err(download_err(format!("Unsupported CRX version: {}", other))),
    }
    .ok_or_else(|| download_err("CRX header length overflows"))?;

    let payload = bytes
        .get(offset..)
        .ok_or_else(|| download_err("CRX header is longer than the package"))?;
    if !payload.starts_with(&ZIP_MAGIC) {
        return Err(download_err("CRX payload is not a zip archive"));
    }
    Ok(payload)
}

/// Extracts a zip archive into `dest`. Entries that would escape `dest` are rejected.
///
/// Blocking; returns the number of files written.
pub fn extract_package(archive: &[u8], dest: &Path) -> Result<usize, RuntimeError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| download_err(format!("Invalid package archive: {}", e)))?;
    fs::create_dir_all(dest).map_err(|e| RuntimeError::Io(format!("Failed to create staging directory: {}", e)))?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| download_err(format!("Corrupt archive entry {}: {}", index, e)))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| download_err(format!("Archive entry escapes package root: {}", entry.name())))?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| RuntimeError::Io(e.to_string()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| RuntimeError::Io(e.to_string()))?;
        }
        let mut file = fs::File::create(&target).map_err(|e| RuntimeError::Io(e.to_string()))?;
        io::copy(&mut entry, &mut file).map_err(|e| RuntimeError::Io(format!("Failed to extract {}: {}", target.display(), e)))?;
        written += 1;
    }
    Ok(written)
}

/// Downloads store packages and installs them through the coordinator.
pub struct StoreInstaller {
    client: reqwest::Client,
    mirrors: Vec<String>,
    retries: u32,
    staging_root: PathBuf,
    runtime: ExtensionRuntime,
}

impl StoreInstaller {
    pub fn new(config: &RuntimeConfig, runtime: ExtensionRuntime) -> Result<Self, RuntimeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(format!("extension-host/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| download_err(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            mirrors: config.store_mirrors.clone(),
            retries: config.download_retries.max(1),
            staging_root: config.data_dir.join("staging"),
            runtime,
        })
    }

    /// Downloads, extracts and installs the package published under `store_id`.
    pub async fn install(&self, store_id: &str) -> Result<ExtensionSummary, RuntimeError> {
        if !is_valid_store_id(store_id) {
            return Err(download_err(format!("Invalid store id: {}", store_id)));
        }
        let package = self.download(store_id).await?;

        let staging = self.staging_root.join(format!("{}-{}", store_id, Uuid::new_v4()));
        let dest = staging.clone();
        let files = tokio::task::spawn_blocking(move || {
            let archive = strip_crx_header(&package)?;
            extract_package(archive, &dest)
        })
        .await
        .map_err(|e| RuntimeError::Io(e.to_string()))?;

        let result = match files {
            Ok(files) => {
                debug!(target: "store", store_id, files, staging = %staging.display(), "package extracted");
                self.runtime.install_store_package(&staging, store_id).await
            }
            Err(e) => Err(e),
        };

        let cleanup = staging.clone();
        if let Ok(Err(e)) = tokio::task::spawn_blocking(move || remove_dir_if_exists(&cleanup)).await {
            warn!(target: "store", staging = %staging.display(), error = %e, "could not remove staging directory");
        }
        if let Ok(summary) = &result {
            info!(target: "store", store_id, extension_id = %summary.id, "store extension installed");
        }
        result
    }

    async fn download(&self, store_id: &str) -> Result<Vec<u8>, RuntimeError> {
        let urls = mirror_urls(&self.mirrors, store_id);
        if urls.is_empty() {
            return Err(download_err("No usable store mirrors configured"));
        }

        let mut last_error = String::new();
        for url in urls {
            let host = url.host_str().unwrap_or_default().to_string();
            for attempt in 1..=self.retries {
                match self.fetch(&url).await {
                    Ok(bytes) => {
                        debug!(target: "store", store_id, mirror = %host, bytes = bytes.len(), "package downloaded");
                        return Ok(bytes);
                    }
                    Err(e) => {
                        warn!(target: "store", store_id, mirror = %host, attempt, error = %e, "download attempt failed");
                        last_error = e;
                        if attempt < self.retries {
                            tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                        }
                    }
                }
            }
        }
        Err(download_err(format!("All mirrors failed for {}: {}", store_id, last_error)))
    }

    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| format!("Failed to read body: {}", e))?;
        if body.is_empty() {
            return Err("Empty package".to_string());
        }
        Ok(body.to_vec())
    }
}
