//! Content package install, listing and removal with a canned fetcher

mod common;

use std::fs;
use std::time::Duration;

use common::{zip_of, TestEnv};
use foundry_instance_manager::core::lock::ScopedLock;
use foundry_instance_manager::ErrorKind;

const SYSTEM_JSON: &[u8] = br#"{"id":"dnd5e","title":"Dungeons & Dragons Fifth Edition","version":"4.1.0"}"#;

fn env_with_instance() -> TestEnv {
    let env = TestEnv::new();
    env.create("alpha", 30000);
    env
}

#[test]
fn install_unpacks_under_the_instance_content_directory() {
    let env = env_with_instance();
    env.fetcher.serve(
        "https://example.test/dnd5e-release.zip",
        zip_of(&[
            ("dnd5e/system.json", SYSTEM_JSON),
            ("dnd5e/lang/en.json", b"{}"),
        ]),
    );

    let package = env
        .content()
        .install("alpha", "https://example.test/dnd5e-release.zip")
        .unwrap();
    assert_eq!(package.id, "dnd5e");
    assert_eq!(package.version.as_deref(), Some("4.1.0"));

    let dir = env.instance_dir("alpha").join("content/dnd5e");
    assert!(dir.join("system.json").is_file());
    assert!(dir.join("lang/en.json").is_file());
    assert!(!env.base_dir.join("shared/dnd5e").exists());
}

#[test]
fn manifest_url_is_followed_to_its_download() {
    let env = env_with_instance();
    env.fetcher.serve(
        "https://example.test/pf2e/system.json",
        br#"{"id":"pf2e","version":"6.0","download":"https://example.test/pf2e/pf2e.zip"}"#.to_vec(),
    );
    env.fetcher.serve(
        "https://example.test/pf2e/pf2e.zip",
        zip_of(&[("system.json", br#"{"id":"pf2e"}"#), ("packs/a.db", b"x")]),
    );

    let content = env.content();
    let package = content
        .install("alpha", "https://example.test/pf2e/system.json")
        .unwrap();
    assert_eq!(package.id, "pf2e");

    let info = content.info("alpha", "pf2e").unwrap();
    assert_eq!(
        info.source_url.as_deref(),
        Some("https://example.test/pf2e/system.json")
    );
    assert!(info.path.join("packs/a.db").is_file());
}

#[test]
fn id_falls_back_to_the_url_file_name() {
    let env = env_with_instance();
    env.fetcher.serve(
        "https://example.test/downloads/my-module.zip?token=abc",
        zip_of(&[("scripts/main.js", b"console.log(1)")]),
    );

    let package = env
        .content()
        .install("alpha", "https://example.test/downloads/my-module.zip?token=abc")
        .unwrap();
    assert_eq!(package.id, "my-module");
}

#[test]
fn second_install_of_the_same_package_conflicts() {
    let env = env_with_instance();
    let url = "https://example.test/dnd5e.zip";
    env.fetcher.serve(url, zip_of(&[("system.json", SYSTEM_JSON)]));

    let content = env.content();
    content.install("alpha", url).unwrap();
    let err = content.install("alpha", url).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn fetch_failure_is_external() {
    let env = env_with_instance();
    let err = env
        .content()
        .install("alpha", "https://example.test/missing.zip")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalFailure);
}

#[test]
fn malformed_archive_leaves_no_trace() {
    let env = env_with_instance();
    let url = "https://example.test/broken.zip";
    env.fetcher.serve(url, b"PK\x03\x04 definitely not a zip".to_vec());

    let err = env.content().install("alpha", url).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptState);

    let content_dir = env.instance_dir("alpha").join("content");
    assert_eq!(fs::read_dir(&content_dir).unwrap().count(), 0);
}

#[test]
fn install_into_unknown_instance_is_not_found() {
    let env = TestEnv::new();
    let err = env
        .content()
        .install("ghost", "https://example.test/dnd5e.zip")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn list_and_remove() {
    let env = env_with_instance();
    let content = env.content();
    assert!(content.list("alpha").unwrap().is_empty());

    env.fetcher.serve(
        "https://example.test/dnd5e.zip",
        zip_of(&[("system.json", SYSTEM_JSON)]),
    );
    content.install("alpha", "https://example.test/dnd5e.zip").unwrap();
    let ids: Vec<String> = content
        .list("alpha")
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec!["dnd5e"]);

    content.remove("alpha", "dnd5e").unwrap();
    assert!(content.list("alpha").unwrap().is_empty());
    let err = content.remove("alpha", "dnd5e").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn install_waits_for_the_instance_lock() {
    let mut env = env_with_instance();
    env.settings.lock_timeout_secs = 0;
    let url = "https://example.test/dnd5e.zip";
    env.fetcher.serve(url, zip_of(&[("system.json", SYSTEM_JSON)]));
    let content = env.content();

    let held = ScopedLock::instance(env.database.scope(), "alpha", Duration::ZERO).unwrap();
    let err = content.install("alpha", url).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(content.list("alpha").unwrap().is_empty());

    drop(held);
    content.install("alpha", url).unwrap();
    assert_eq!(content.list("alpha").unwrap().len(), 1);
}

#[test]
fn missing_content_directory_is_corrupt_state() {
    let env = env_with_instance();
    let url = "https://example.test/dnd5e.zip";
    env.fetcher.serve(url, zip_of(&[("system.json", SYSTEM_JSON)]));
    let content_dir = env.instance_dir("alpha").join("content");
    fs::remove_dir(&content_dir).unwrap();

    let err = env.content().install("alpha", url).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptState);
    assert!(!content_dir.exists());
}
