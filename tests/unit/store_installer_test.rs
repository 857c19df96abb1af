//! Unit tests for store package handling: ids, mirrors, CRX envelopes and extraction.

#[path = "../support/mod.rs"]
mod support;

use std::io::{Cursor, Write};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use extension_host::app::App;
use extension_host::services::store_installer::{
    extract_package, is_valid_store_id, mirror_urls, strip_crx_header, CRX_MAGIC,
};
use extension_host::types::errors::RuntimeError;

use support::{test_config, FakePrompt, TestHost};

const STORE_ID: &str = "abcdefghijklmnopabcdefghijklmnop";

fn zip_with(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn crx3(payload: &[u8], header: &[u8]) -> Vec<u8> {
    let mut bytes = CRX_MAGIC.to_vec();
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
    bytes.extend_from_slice(header);
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn store_ids_are_32_letters_a_to_p() {
    assert!(is_valid_store_id(STORE_ID));
    assert!(!is_valid_store_id("abc"));
    assert!(!is_valid_store_id("zbcdefghijklmnopabcdefghijklmnop"));
    assert!(!is_valid_store_id("ABCDEFGHIJKLMNOPABCDEFGHIJKLMNOP"));
}

#[test]
fn mirror_templates_expand_and_skip_unusable_ones() {
    let templates = vec![
        "https://mirror.test/crx?id={id}".to_string(),
        "file:///tmp/{id}.crx".to_string(),
        "not a url {id}".to_string(),
        "http://second.test/{id}.crx".to_string(),
    ];

    let urls = mirror_urls(&templates, STORE_ID);

    let rendered: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
    assert_eq!(
        rendered,
        vec![
            format!("https://mirror.test/crx?id={}", STORE_ID),
            format!("http://second.test/{}.crx", STORE_ID),
        ]
    );
}

#[test]
fn crx3_header_is_stripped() {
    let archive = zip_with(&[("manifest.json", "{}")]);
    let package = crx3(&archive, b"signed header bytes");

    let payload = strip_crx_header(&package).unwrap();

    assert_eq!(payload, archive.as_slice());
}

#[test]
fn bare_zip_passes_through() {
    let archive = zip_with(&[("a.txt", "a")]);
    assert_eq!(strip_crx_header(&archive).unwrap(), archive.as_slice());
}

#[test]
fn malformed_packages_are_download_errors() {
    let archive = zip_with(&[("a.txt", "a")]);

    let not_a_package = strip_crx_header(b"<html>404</html>");
    assert!(matches!(not_a_package, Err(RuntimeError::Download(_))));

    let mut bad_version = crx3(&archive, b"");
    bad_version[4] = 9;
    assert_eq!(
        strip_crx_header(&bad_version),
        Err(RuntimeError::Download("Unsupported CRX version: 9".to_string()))
    );

    let mut truncated = CRX_MAGIC.to_vec();
    truncated.extend_from_slice(&3u32.to_le_bytes());
    truncated.extend_from_slice(&1000u32.to_le_bytes());
    assert!(matches!(strip_crx_header(&truncated), Err(RuntimeError::Download(_))));
}

#[test]
fn extract_writes_nested_files() {
    let archive = zip_with(&[
        ("manifest.json", r#"{"name":"x"}"#),
        ("js/background.js", "void 0;"),
    ]);
    let dest = TempDir::new().unwrap();

    let written = extract_package(&archive, dest.path()).unwrap();

    assert_eq!(written, 2);
    assert_eq!(
        std::fs::read_to_string(dest.path().join("js/background.js")).unwrap(),
        "void 0;"
    );
}

#[test]
fn extract_rejects_entries_outside_the_root() {
    let archive = zip_with(&[("../escape.txt", "nope")]);
    let dest = TempDir::new().unwrap();

    let result = extract_package(&archive, &dest.path().join("pkg"));

    assert!(matches!(result, Err(RuntimeError::Download(_))));
    assert!(!dest.path().join("escape.txt").exists());
}

#[tokio::test]
async fn install_without_mirrors_fails_cleanly() {
    let data = TempDir::new().unwrap();
    let host = TestHost::new(FakePrompt::accepting());
    let app = App::new(test_config(data.path()), host.collaborators()).unwrap();

    let invalid = app.store.install("nope").await;
    assert_eq!(invalid, Err(RuntimeError::Download("Invalid store id: nope".to_string())));

    let no_mirrors = app.store.install(STORE_ID).await;
    assert_eq!(
        no_mirrors,
        Err(RuntimeError::Download("No usable store mirrors configured".to_string()))
    );
    assert!(app.runtime.list().await.unwrap().is_empty());
    app.shutdown().await;
}
