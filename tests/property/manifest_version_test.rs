//! Property-based tests for manifest and extension version validation.

use extension_host::services::manifest_parser::{is_valid_version, ManifestParser};
use extension_host::types::errors::ManifestError;
use proptest::prelude::*;
use serde_json::json;

/// One to four dot-separated numeric parts.
fn arb_valid_version() -> impl Strategy<Value = String> {
    proptest::collection::vec(0u32..65536, 1..=4).prop_map(|parts| {
        parts
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(".")
    })
}

fn manifest_bytes(manifest_version: i64, version: &str) -> Vec<u8> {
    json!({
        "manifest_version": manifest_version,
        "name": "Versioned",
        "version": version,
    })
    .to_string()
    .into_bytes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Property: dotted numeric versions with up to four parts are accepted and kept verbatim.
    #[test]
    fn valid_versions_are_accepted(version in arb_valid_version(), mv in prop_oneof![Just(2i64), Just(3i64)]) {
        prop_assert!(is_valid_version(&version));
        let manifest = ManifestParser::parse_bytes(&manifest_bytes(mv, &version)).unwrap();
        prop_assert_eq!(manifest.version, version);
    }

    // Property: five or more parts are rejected.
    #[test]
    fn too_many_parts_are_rejected(parts in proptest::collection::vec(0u32..1000, 5..8)) {
        let version = parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".");
        prop_assert!(!is_valid_version(&version));
        let result = ManifestParser::parse_bytes(&manifest_bytes(3, &version));
        prop_assert_eq!(result.err(), Some(ManifestError::InvalidVersionFormat(version)));
    }

    // Property: any non-digit outside the separators makes a version invalid.
    #[test]
    fn non_numeric_versions_are_rejected(
        head in arb_valid_version(),
        junk in "[a-zA-Z_ +-]{1,4}",
        tail in "[0-9]{0,3}",
    ) {
        let version = format!("{}{}{}", head, junk, tail);
        prop_assert!(!is_valid_version(&version));
    }

    // Property: only manifest versions 2 and 3 are supported.
    #[test]
    fn unsupported_manifest_versions_are_rejected(mv in (-5i64..20).prop_filter("supported", |v| *v != 2 && *v != 3)) {
        let result = ManifestParser::parse_bytes(&manifest_bytes(mv, "1.0"));
        prop_assert_eq!(result.err(), Some(ManifestError::UnsupportedVersion(mv.to_string())));
    }

    // Property: non-integer numbers are unsupported versions, never parse errors.
    #[test]
    fn fractional_manifest_versions_are_unsupported(mv in -100.0f64..100.0) {
        prop_assume!(mv.fract() != 0.0);
        let bytes = json!({"manifest_version": mv, "name": "x", "version": "1"}).to_string().into_bytes();
        let result = ManifestParser::parse_bytes(&bytes);
        let is_unsupported = matches!(result, Err(ManifestError::UnsupportedVersion(_)));
        prop_assert!(is_unsupported, "got {:?}", result);
    }
}
