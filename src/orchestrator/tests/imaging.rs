use super::*;
use crate::device::mock::Call;
use crate::error::ValidationError;
use crate::orchestrator::lock::LOCK_WARNING;
use crate::orchestrator::sideload_flow::BOOT_CHECK;
use crate::types::{DeviceMode, ImageSource, Protocol, ResolvedArtifacts};
use std::io::Write;
use std::path::{Path, PathBuf};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ::zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        ::zip::write::FileOptions::default().compression_method(::zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn factory_bundle() -> Vec<u8> {
    let inner = zip_bytes(&[
        ("android-info.txt", b"require board=husky"),
        ("boot.img", b"BOOT"),
        ("bootloader-husky.img", b"BL"),
        ("vendor_boot.img", b"VENDOR_BOOT"),
        ("radio-husky.img", b"RADIO"),
        ("system.img", b"SYSTEM"),
    ]);
    zip_bytes(&[
        ("husky/flash-all.sh", b"#!/bin/sh"),
        ("husky/image-husky-ap2a.zip", &inner),
    ])
}

fn ota_bundle(payload_len: usize) -> Vec<u8> {
    let payload = vec![0xC3u8; payload_len];
    zip_bytes(&[
        ("payload_properties.txt", b"FILE_HASH=abc"),
        ("payload.bin", &payload),
    ])
}

fn local(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, ResolvedArtifacts) {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    let artifacts = ResolvedArtifacts {
        key: None,
        image: Some(ImageSource::Local { path: path.clone() }),
    };
    (path, artifacts)
}

fn remote(url: String) -> ResolvedArtifacts {
    ResolvedArtifacts {
        key: None,
        image: Some(ImageSource::Url { url, sha256: None }),
    }
}

fn unlocked_bootloader() -> MockDevice {
    let device = MockDevice::bootloader("SER1");
    device.set_unlocked(true);
    device
}

fn written_partitions(device: &MockDevice) -> Vec<String> {
    device.written().into_iter().map(|(p, _)| p).collect()
}

fn cached_files(cache_dir: &Path) -> Vec<String> {
    match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn factory_bundle_is_flashed_from_fastbootd_in_archive_order() {
    let mut h = Harness::new(unlocked_bootloader());
    let (bundle, artifacts) = local(h.dir.path(), "husky-factory.zip", &factory_bundle());

    h.flasher
        .run(
            &plan(|p| {
                p.flash_zip = true;
                p.wipe_data = true;
            }),
            &artifacts,
        )
        .await
        .unwrap();

    assert_eq!(
        written_partitions(&h.device),
        vec!["boot", "vendor_boot", "system"]
    );
    assert_eq!(h.device.written()[2].1, b"SYSTEM".to_vec());
    assert_eq!(
        h.device.commands(),
        vec!["reboot-fastboot", "erase:userdata", "erase:metadata"]
    );
    assert!(bundle.exists());

    let events = h.events();
    let last_imaging = events
        .iter()
        .filter_map(|e| match e {
            Event::Progress(p) if p.stage == "imaging" => Some(p.clone()),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last_imaging.item, "system");
    assert_eq!(last_imaging.fraction, 1.0);
}

#[tokio::test]
async fn partition_failure_is_fatal_and_drops_cached_bundle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/builds/husky-factory.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(factory_bundle()))
        .expect(2)
        .mount(&server)
        .await;

    let device = unlocked_bootloader();
    device.fail_writes("system", 1);
    let mut h = Harness::new(device);
    let cache_dir = h.dir.path().join("cache");
    let artifacts = remote(format!("{}/builds/husky-factory.zip", server.uri()));
    let flash = plan(|p| p.flash_zip = true);

    let err = h.flasher.run(&flash, &artifacts).await.unwrap_err();

    assert_eq!(err.stage(), Some(FlashState::Imaging));
    assert!(matches!(
        cause(&err),
        Error::PartitionFlash { partition, .. } if partition == "system"
    ));
    assert_eq!(written_partitions(&h.device), vec!["boot", "vendor_boot"]);
    assert!(cached_files(&cache_dir).is_empty());

    // The next run downloads a fresh copy
    h.flasher.run(&flash, &artifacts).await.unwrap();
    assert_eq!(cached_files(&cache_dir), vec!["husky-factory.zip"]);
}

#[tokio::test]
async fn cancelled_run_keeps_downloaded_bundle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/builds/husky-ota.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ota_bundle(4096)))
        .mount(&server)
        .await;

    // Never comes back from the reboot into recovery
    let device = unlocked_bootloader();
    device.set_reboot_absence(100_000);
    let mut h = Harness::with_config(device, |c| c.detect.max_ticks = 100_000);
    let cache_dir = h.dir.path().join("cache");
    let artifacts = remote(format!("{}/builds/husky-ota.zip", server.uri()));

    let cancel = h.flasher.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });
    let err = h
        .flasher
        .run(&plan(|p| p.flash_zip = true), &artifacts)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(FlashState::Imaging));
    assert!(matches!(cause(&err), Error::Cancelled));
    assert!(err.is_user_abort());
    assert_eq!(cached_files(&cache_dir), vec!["husky-ota.zip"]);

    let events = h.events();
    let logs = logs(&events);
    assert!(logs
        .iter()
        .any(|(level, msg)| *level == LogLevel::Info && msg.starts_with("Run cancelled")));
    assert!(!logs.iter().any(|(_, msg)| msg.starts_with("CRITICAL ERROR")));
}

#[tokio::test]
async fn error_page_instead_of_bundle_is_rejected_and_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/builds/husky-factory.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>quota exceeded</html>"))
        .mount(&server)
        .await;

    let mut h = Harness::new(unlocked_bootloader());
    let cache_dir = h.dir.path().join("cache");
    let artifacts = remote(format!("{}/builds/husky-factory.zip", server.uri()));

    let err = h
        .flasher
        .run(&plan(|p| p.flash_zip = true), &artifacts)
        .await
        .unwrap_err();

    assert!(matches!(
        cause(&err),
        Error::Validation(ValidationError::NotAnArchive { .. })
    ));
    assert!(cached_files(&cache_dir).is_empty());
    assert!(h.device.commands().is_empty());
    assert!(h.device.written().is_empty());
}

#[tokio::test]
async fn ota_bundle_is_sideloaded_from_recovery() {
    let mut h = Harness::new(unlocked_bootloader());
    let (bundle, artifacts) = local(h.dir.path(), "husky-ota.zip", &ota_bundle(150_000));
    let bundle_len = std::fs::metadata(&bundle).unwrap().len();

    h.flasher
        .run(&plan(|p| p.flash_zip = true), &artifacts)
        .await
        .unwrap();

    let calls = h.device.calls();
    let recovery = calls
        .iter()
        .position(|c| *c == Call::Command("reboot-recovery".to_string()))
        .unwrap();
    let first_adb = calls
        .iter()
        .position(|c| *c == Call::Connect(Protocol::Adb))
        .unwrap();
    assert!(recovery < first_adb);
    assert!(calls.contains(&Call::SideloadOpen(bundle_len)));
    assert!(!calls.iter().any(|c| matches!(c, Call::Write { .. })));
    assert_eq!(h.device.commands(), vec!["reboot-recovery"]);
    assert_eq!(h.device.mode(), DeviceMode::AdbNormal);
    assert!(h.prompts().is_empty());

    let events = h.events();
    assert!(!states(&events).contains(&FlashState::Locking));
}

#[tokio::test]
async fn ota_with_lock_waits_for_boot_confirmation_then_locks() {
    let mut h = Harness::new(unlocked_bootloader());
    let (_, artifacts) = local(h.dir.path(), "husky-ota.zip", &ota_bundle(4096));

    h.flasher
        .run(
            &plan(|p| {
                p.flash_zip = true;
                p.lock = true;
            }),
            &artifacts,
        )
        .await
        .unwrap();

    assert_eq!(
        h.prompts(),
        vec![BOOT_CHECK.to_string(), LOCK_WARNING.to_string()]
    );
    assert_eq!(
        h.device.commands(),
        vec!["reboot-recovery", "reboot:bootloader", "flashing lock"]
    );
    assert!(!h.device.is_unlocked());
    assert_eq!(h.device.mode(), DeviceMode::Bootloader);

    let events = h.events();
    assert_eq!(
        states(&events),
        vec![FlashState::Connecting, FlashState::Imaging, FlashState::Done]
    );
}

#[tokio::test]
async fn unconfirmed_boot_skips_lock_after_ota() {
    let mut h = Harness::new(unlocked_bootloader());
    h.answer(&[GateResponse::Decline]);
    let (_, artifacts) = local(h.dir.path(), "husky-ota.zip", &ota_bundle(4096));

    h.flasher
        .run(
            &plan(|p| {
                p.flash_zip = true;
                p.lock = true;
            }),
            &artifacts,
        )
        .await
        .unwrap();

    assert_eq!(h.prompts(), vec![BOOT_CHECK.to_string()]);
    assert_eq!(h.device.commands(), vec!["reboot-recovery"]);
    assert!(h.device.is_unlocked());
    let events = h.events();
    assert!(logs(&events).iter().any(|(level, msg)| {
        *level == LogLevel::Warning && msg.starts_with("Boot not confirmed")
    }));
}

#[tokio::test]
async fn interrupted_sideload_aborts_with_offset() {
    let device = unlocked_bootloader();
    device.fail_sideload_at(1);
    let mut h = Harness::new(device);
    let (bundle, artifacts) = local(h.dir.path(), "husky-ota.zip", &ota_bundle(150_000));

    let err = h
        .flasher
        .run(&plan(|p| p.flash_zip = true), &artifacts)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(FlashState::Imaging));
    match cause(&err) {
        Error::SideloadInterrupted { offset, total, .. } => {
            assert_eq!(*offset, 65_536);
            assert_eq!(*total, std::fs::metadata(&bundle).unwrap().len());
        }
        other => panic!("unexpected error: {other}"),
    }
    // Caller-owned bundles survive a failed run
    assert!(bundle.exists());
}
