//! Tests for settings persistence as seen through the services container.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use snaptube_core::{
    AppServices, ConversionRequest, Converter, Extractor, ProgressSender, RawMetadata,
    ResolutionError, ServicesConfig, SettingsStore, Theme, TransferControl, TransferError,
    TransferOutcome, TransferRequest, settings::keys,
};
use tempfile::TempDir;

/// Backend for tests that never reach a tool.
struct Unreachable;

impl Extractor for Unreachable {
    fn extract(&self, locator: &str) -> Result<RawMetadata, ResolutionError> {
        panic!("unexpected extract of {locator}");
    }

    fn download(
        &self,
        request: &TransferRequest,
        _control: &TransferControl,
        _progress: ProgressSender,
    ) -> Result<TransferOutcome, TransferError> {
        panic!("unexpected download of {}", request.locator);
    }
}

impl Converter for Unreachable {
    fn extract_audio(
        &self,
        request: &ConversionRequest,
        _control: &TransferControl,
        _progress: ProgressSender,
    ) -> Result<TransferOutcome, TransferError> {
        panic!("unexpected conversion of {}", request.input.display());
    }
}

fn services(settings_path: &std::path::Path) -> AppServices {
    AppServices::initialize(
        ServicesConfig::default()
            .with_settings_path(settings_path)
            .with_extractor(Arc::new(Unreachable))
            .with_converter(Arc::new(Unreachable)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_theme_change_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config").join("settings.json");

    SettingsStore::open(&path)
        .set(keys::DOWNLOAD_PATH, dir.path().join("downloads"))
        .unwrap();

    let first = services(&path);
    assert_eq!(first.settings().snapshot().theme, Theme::Dark);
    first.settings().set(keys::THEME, "light").unwrap();
    first.shutdown().await;

    let second = services(&path);
    assert_eq!(second.settings().snapshot().theme, Theme::Light);
    assert_eq!(second.settings().get(keys::THEME, String::new()), "light");
    second.shutdown().await;
}

#[tokio::test]
async fn test_registry_picks_up_settings_on_next_initialize() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    let downloads = dir.path().join("media");

    let store = SettingsStore::open(&path);
    store.set(keys::DOWNLOAD_PATH, &downloads).unwrap();
    store.set(keys::DEFAULT_QUALITY, "1080p").unwrap();
    store.set(keys::CONCURRENT_DOWNLOADS, 50).unwrap();
    store.set(keys::AUTO_CONVERT_AUDIO, true).unwrap();

    let services = services(&path);
    let config = services.registry().config();
    assert_eq!(config.download_dir, downloads);
    assert_eq!(config.default_quality, "1080p");
    assert_eq!(config.max_concurrent_jobs, 8);
    assert!(config.auto_convert_audio);
    assert!(downloads.is_dir());
    services.shutdown().await;
}

#[tokio::test]
async fn test_corrupted_settings_fall_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = SettingsStore::open(&path);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.theme, Theme::Dark);
    assert_eq!(snapshot.language, "en");
    assert_eq!(snapshot.default_quality, "720p");

    let rewritten: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(rewritten["theme"], "dark");
}
