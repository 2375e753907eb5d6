//! Tests for lazy media download in `src/media/mod.rs`.

use std::sync::Arc;
use std::time::Duration;

use wabridge::ingest::Dispatcher;
use wabridge::media::{MediaError, MediaPipeline};
use wabridge::network::{NetworkClient, NetworkEvent};
use wabridge::store::Store;

use crate::support::{image_message, memory_store, text_message, FakeNetwork};

const CHAT: &str = "123@g.us";

async fn setup(cache: &std::path::Path) -> (Store, Arc<FakeNetwork>, Arc<MediaPipeline>) {
    let store = memory_store().await;
    let network = FakeNetwork::new();
    let client: Arc<dyn NetworkClient> = Arc::clone(&network) as Arc<dyn NetworkClient>;
    let pipeline = Arc::new(MediaPipeline::new(store.clone(), client, cache));
    (store, network, pipeline)
}

async fn ingest(store: &Store, event: NetworkEvent) {
    Dispatcher::new(store.clone()).apply(event).await;
}

#[tokio::test]
async fn first_fetch_downloads_and_records_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, network, pipeline) = setup(dir.path()).await;
    network.put_media(b"loc-1", b"jpeg");
    ingest(&store, NetworkEvent::Message(image_message(CHAT, "img", 0, b"loc-1"))).await;

    let path = pipeline
        .fetch(CHAT, "img")
        .await
        .expect("fetch")
        .expect("message has media");

    assert_eq!(std::fs::read(&path).expect("cached file"), b"jpeg");
    assert!(path.starts_with(dir.path()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
    let reference = store
        .media_reference(CHAT, "img")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(reference.local_path.as_deref(), Some(path.as_path()));
}

#[tokio::test]
async fn cached_media_is_not_fetched_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, network, pipeline) = setup(dir.path()).await;
    network.put_media(b"loc-1", b"jpeg");
    ingest(&store, NetworkEvent::Message(image_message(CHAT, "img", 0, b"loc-1"))).await;

    let first = pipeline.fetch(CHAT, "img").await.expect("first");
    let second = pipeline.fetch(CHAT, "img").await.expect("second");

    assert_eq!(first, second);
    assert_eq!(network.fetches(), 1);
}

#[tokio::test]
async fn concurrent_fetches_share_one_download() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, network, pipeline) = setup(dir.path()).await;
    network.put_media(b"loc-1", b"jpeg");
    network.set_fetch_delay(Duration::from_millis(50));
    ingest(&store, NetworkEvent::Message(image_message(CHAT, "img", 0, b"loc-1"))).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move { pipeline.fetch(CHAT, "img").await }));
    }
    let mut paths = Vec::new();
    for handle in handles {
        paths.push(handle.await.expect("join").expect("fetch"));
    }

    assert_eq!(network.fetches(), 1);
    assert!(paths.iter().all(|p| p.is_some() && *p == paths[0]));
}

#[tokio::test]
async fn message_without_media_yields_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, network, pipeline) = setup(dir.path()).await;
    ingest(
        &store,
        NetworkEvent::Message(text_message(CHAT, "txt", "a@s.whatsapp.net", 0, "hi")),
    )
    .await;

    assert!(pipeline.fetch(CHAT, "txt").await.expect("fetch").is_none());
    assert!(pipeline.fetch(CHAT, "missing").await.expect("fetch").is_none());
    assert_eq!(network.fetches(), 0);
}

#[tokio::test]
async fn expired_locator_is_a_fetch_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, _network, pipeline) = setup(dir.path()).await;
    ingest(&store, NetworkEvent::Message(image_message(CHAT, "img", 0, b"gone"))).await;

    let result = pipeline.fetch(CHAT, "img").await;

    assert!(matches!(result, Err(MediaError::Fetch(_))));
    let reference = store
        .media_reference(CHAT, "img")
        .await
        .expect("read")
        .expect("present");
    assert!(reference.local_path.is_none());
}

#[tokio::test]
async fn pruned_cache_file_is_restored_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, network, pipeline) = setup(dir.path()).await;
    network.put_media(b"loc-1", b"jpeg");
    ingest(&store, NetworkEvent::Message(image_message(CHAT, "img", 0, b"loc-1"))).await;
    let path = pipeline
        .fetch(CHAT, "img")
        .await
        .expect("fetch")
        .expect("path");

    std::fs::remove_file(&path).expect("prune");
    let again = pipeline
        .fetch(CHAT, "img")
        .await
        .expect("refetch")
        .expect("path");

    assert_eq!(again, path);
    assert!(again.exists());
    assert_eq!(network.fetches(), 2);
}

#[tokio::test]
async fn downloaded_media_shows_up_in_message_context() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, network, pipeline) = setup(dir.path()).await;
    network.put_media(b"loc-1", b"jpeg");
    ingest(&store, NetworkEvent::Message(image_message(CHAT, "img", 1, b"loc-1"))).await;
    ingest(
        &store,
        NetworkEvent::Message(text_message(CHAT, "after", "a@s.whatsapp.net", 2, "nice")),
    )
    .await;

    let path = pipeline
        .fetch(CHAT, "img")
        .await
        .expect("fetch")
        .expect("path");
    let context = store
        .get_message_context(CHAT, "img", 1, 1)
        .await
        .expect("context")
        .expect("present");

    let media = context.message.media.expect("media reference");
    assert_eq!(media.local_path, Some(path));
    assert_eq!(media.mime_type, "image/jpeg");
    assert_eq!(context.after.len(), 1);
}
