// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::reporter::{EventReporter, NoOpReporter};
use crate::types::Event;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cache_in(dir: &TempDir) -> ArtifactCache {
    ArtifactCache::new(
        CacheConfig {
            dir: dir.path().join("cache"),
            ..CacheConfig::default()
        },
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        },
    )
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn head_with_length(len: u64) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-length", len.to_string().as_str())
        .set_body_bytes(vec![0u8; len as usize])
}

async fn seed(cache_dir: &std::path::Path, name: &str, content: &[u8]) {
    tokio::fs::create_dir_all(cache_dir).await.unwrap();
    tokio::fs::write(cache_dir.join(name), content).await.unwrap();
}

#[test]
fn cache_key_uses_last_path_segment() {
    assert_eq!(
        cache_key("https://builds.example.com/releases/husky/husky-ota-2024.zip?sig=abc").unwrap(),
        "husky-ota-2024.zip"
    );
    assert_eq!(cache_key("https://example.com/a/b/").unwrap(), "b");
    assert_eq!(cache_key("https://example.com/").unwrap(), "artifact");
    assert_eq!(cache_key("https://example.com/x/my%20build.zip").unwrap(), "my_20build.zip");
    assert!(matches!(cache_key("not a url"), Err(Error::Config { .. })));
}

#[tokio::test]
async fn first_resolve_streams_download_into_cache() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/builds/husky.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = cache_in(&dir);
    let reporter = EventReporter::new(1024);
    let mut events = reporter.subscribe();
    let source = ImageSource::Url {
        url: format!("{}/builds/husky.zip", server.uri()),
        sha256: None,
    };

    let artifact = cache.resolve(&source, &reporter).await.unwrap();

    assert_eq!(artifact.name, "husky.zip");
    assert_eq!(artifact.size_bytes, body.len() as u64);
    assert_eq!(artifact.origin, ArtifactOrigin::Cache);
    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), body);
    assert!(!dir.path().join("cache/husky.zip.part").exists());

    let mut last = 0.0;
    while let Ok(event) = events.try_recv() {
        if let Event::Progress(p) = event {
            assert!(p.fraction >= last);
            last = p.fraction;
        }
    }
    assert_eq!(last, 1.0);
}

#[tokio::test]
async fn matching_size_reuses_cache_without_downloading() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/husky.zip"))
        .respond_with(head_with_length(4096 + 512))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10]))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("cache"), "husky.zip", &[7u8; 4096]).await;
    let cache = cache_in(&dir);
    let source = ImageSource::Url {
        url: format!("{}/husky.zip", server.uri()),
        sha256: None,
    };

    let artifact = cache.resolve(&source, &NoOpReporter).await.unwrap();

    assert_eq!(artifact.size_bytes, 4096);
}

#[tokio::test]
async fn size_outside_tolerance_downloads_again() {
    let server = MockServer::start().await;
    let fresh = vec![9u8; 8192];
    Mock::given(method("HEAD"))
        .and(path("/husky.zip"))
        .respond_with(head_with_length(8192))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/husky.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fresh.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("cache"), "husky.zip", &[7u8; 4096]).await;
    let cache = cache_in(&dir);
    let source = ImageSource::Url {
        url: format!("{}/husky.zip", server.uri()),
        sha256: None,
    };

    let artifact = cache.resolve(&source, &NoOpReporter).await.unwrap();

    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), fresh);
}

#[tokio::test]
async fn repeated_resolve_downloads_body_once() {
    let server = MockServer::start().await;
    let body = vec![3u8; 5000];
    Mock::given(method("HEAD"))
        .and(path("/bundle.zip"))
        .respond_with(head_with_length(5000))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bundle.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = cache_in(&dir);
    let source = ImageSource::Url {
        url: format!("{}/bundle.zip", server.uri()),
        sha256: None,
    };

    let first = cache.resolve(&source, &NoOpReporter).await.unwrap();
    let second = cache.resolve(&source, &NoOpReporter).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn checksum_mismatch_on_cache_hit_triggers_download() {
    let server = MockServer::start().await;
    let good = vec![5u8; 2048];
    Mock::given(method("HEAD"))
        .respond_with(head_with_length(2048))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/husky.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(good.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    // same size, different content
    seed(&dir.path().join("cache"), "husky.zip", &[6u8; 2048]).await;
    let cache = cache_in(&dir);
    let source = ImageSource::Url {
        url: format!("{}/husky.zip", server.uri()),
        sha256: Some(sha256_hex(&good)),
    };

    let artifact = cache.resolve(&source, &NoOpReporter).await.unwrap();

    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), good);
}

#[tokio::test]
async fn checksum_mismatch_after_download_deletes_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/husky.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 100]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = cache_in(&dir);
    let source = ImageSource::Url {
        url: format!("{}/husky.zip", server.uri()),
        sha256: Some(sha256_hex(b"something else")),
    };

    let err = cache.resolve(&source, &NoOpReporter).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Validation(ValidationError::ChecksumMismatch { .. })
    ));
    assert!(!dir.path().join("cache/husky.zip").exists());
}

#[tokio::test]
async fn failed_probe_with_published_hash_still_reuses_cache() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let content = vec![8u8; 1000];
    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("cache"), "husky.zip", &content).await;
    let cache = cache_in(&dir);
    let source = ImageSource::Url {
        url: format!("{}/husky.zip", server.uri()),
        sha256: Some(sha256_hex(&content)),
    };

    assert!(cache.resolve(&source, &NoOpReporter).await.is_ok());
}

#[tokio::test]
async fn http_error_leaves_no_cache_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = cache_in(&dir);
    let source = ImageSource::Url {
        url: format!("{}/missing.zip", server.uri()),
        sha256: None,
    };

    assert!(matches!(
        cache.resolve(&source, &NoOpReporter).await,
        Err(Error::Network(_))
    ));
    assert!(!dir.path().join("cache/missing.zip").exists());
}

#[tokio::test]
async fn local_sources_skip_network_and_survive_invalidation() {
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("factory.zip");
    tokio::fs::write(&local, vec![0u8; 321]).await.unwrap();
    let cache = cache_in(&dir);

    let artifact = cache
        .resolve(&ImageSource::Local { path: local.clone() }, &NoOpReporter)
        .await
        .unwrap();
    assert_eq!(artifact.origin, ArtifactOrigin::Local);
    assert_eq!(artifact.size_bytes, 321);

    cache.invalidate(&artifact).await.unwrap();
    assert!(local.exists());
}

#[tokio::test]
async fn invalidate_removes_cached_entry() {
    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("cache"), "husky.zip", b"stale").await;
    let cache = cache_in(&dir);
    let artifact = cache.artifact("husky.zip", 5);

    cache.invalidate(&artifact).await.unwrap();

    assert!(!artifact.path.exists());
}
