#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use reftest_core::api::SubmitRequest;
use reftest_core::model::{ManifestEntry, TestKind};
use reftest_harness::config::HarnessConfig;
use reftest_harness::service::HarnessService;
use reftest_harness::supervisor::build_service;

/// "ABC" and "XYZ" as PNG data URIs; the bytes only need to differ.
pub const PNG_A: &str = "data:image/png;base64,QUJD";
pub const PNG_B: &str = "data:image/png;base64,WFla";
pub const PNG_C: &str = "data:image/png;base64,Y2Nj";

pub fn entry(id: &str, kind: TestKind, rounds: usize) -> ManifestEntry {
    ManifestEntry {
        id: id.into(),
        kind,
        file: format!("pdfs/{id}.pdf"),
        rounds,
        md5: None,
        link: false,
    }
}

pub fn config(root: &Path) -> HarnessConfig {
    let mut cfg = HarnessConfig::new(root, root.join("test_manifest.json"));
    cfg.platform = "linux".into();
    cfg
}

pub fn service(cfg: &HarnessConfig, entries: Vec<ManifestEntry>, browsers: &[&str]) -> Arc<HarnessService> {
    let names: Vec<String> = browsers.iter().map(|b| b.to_string()).collect();
    build_service(cfg, entries, &names)
}

pub fn page(browser: &str, id: &str, round: usize, page: u32, last: u32, snapshot: &str) -> SubmitRequest {
    SubmitRequest {
        browser: browser.into(),
        id: id.into(),
        round,
        page,
        snapshot: Some(snapshot.into()),
        failure: None,
        last_page_num: last,
        stats: None,
    }
}
