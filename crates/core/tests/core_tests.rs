//! Integration tests for the core crate.

use reftest_core::api::SubmitRequest;
use reftest_core::model::{ManifestEntry, TestKind};

#[test]
fn test_kind_serde() {
    let fbf = TestKind::Fbf;
    let serialized = serde_json::to_string(&fbf).unwrap();
    assert_eq!(serialized, r#""fbf""#);
    let deserialized: TestKind = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized, fbf);
}

#[test]
fn unknown_test_kind_is_rejected() {
    let err = serde_json::from_str::<ManifestEntry>(
        r#"{"id": "a", "type": "pixel", "file": "a.pdf", "rounds": 1}"#,
    );
    assert!(err.is_err());
}

#[test]
fn manifest_entry_defaults() {
    let entry: ManifestEntry =
        serde_json::from_str(r#"{"id": "tracemonkey", "type": "eq", "file": "pdfs/tracemonkey.pdf"}"#)
            .unwrap();
    assert_eq!(entry.rounds, 1);
    assert_eq!(entry.kind, TestKind::Eq);
    assert!(entry.md5.is_none());
    assert!(!entry.link);
}

#[test]
fn submit_request_accepts_false_failure() {
    let req: SubmitRequest = serde_json::from_str(
        r#"{
            "browser": "firefox",
            "id": "doc1",
            "round": 0,
            "page": 1,
            "snapshot": "data:image/png;base64,AA==",
            "failure": false,
            "lastPageNum": 1
        }"#,
    )
    .unwrap();
    assert_eq!(req.failure, None);
    assert_eq!(req.last_page_num, 1);
    assert!(req.stats.is_none());
}

#[test]
fn submit_request_keeps_failure_message() {
    let req: SubmitRequest = serde_json::from_str(
        r#"{
            "browser": "firefox",
            "id": "doc1",
            "round": 0,
            "page": 2,
            "snapshot": null,
            "failure": "render: bad XRef",
            "lastPageNum": 3,
            "stats": [{"name": "Rendering", "start": 1, "end": 5}]
        }"#,
    )
    .unwrap();
    assert_eq!(req.failure.as_deref(), Some("render: bad XRef"));
    assert!(req.snapshot.is_none());
    assert!(req.stats.is_some());
}

#[test]
fn submit_request_requires_last_page_num() {
    let res = serde_json::from_str::<SubmitRequest>(
        r#"{"browser": "firefox", "id": "doc1", "round": 0, "page": 1, "failure": null}"#,
    );
    assert!(res.is_err());
}
