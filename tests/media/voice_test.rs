//! Tests for voice-note preparation in `src/media/`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use wabridge::config::MediaConfig;
use wabridge::media::{is_ogg_opus, FfmpegTranscoder, MediaError, MediaPipeline, Transcoder};
use wabridge::network::NetworkClient;

use crate::support::{memory_store, write_mp3, write_opus, FakeNetwork, FakeTranscoder};

async fn pipeline(cache: &std::path::Path, transcoder: Option<Arc<dyn Transcoder>>) -> MediaPipeline {
    let client: Arc<dyn NetworkClient> = FakeNetwork::new();
    let pipeline = MediaPipeline::new(memory_store().await, client, cache);
    match transcoder {
        Some(transcoder) => pipeline.with_transcoder(transcoder),
        None => pipeline,
    }
}

#[tokio::test]
async fn opus_input_passes_through_unchanged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transcoder = FakeTranscoder::new(&dir.path().join("out"));
    let pipeline = pipeline(dir.path(), Some(transcoder.clone() as Arc<dyn Transcoder>)).await;
    let input = write_opus(dir.path(), "note.ogg");

    let prepared = pipeline.prepare_voice_note(&input).await.expect("prepare");

    assert_eq!(prepared.path, input);
    assert!(!prepared.converted);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn other_audio_is_transcoded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transcoder = FakeTranscoder::new(&dir.path().join("out"));
    let pipeline = pipeline(dir.path(), Some(transcoder.clone() as Arc<dyn Transcoder>)).await;
    let input = write_mp3(dir.path(), "note.mp3");

    let prepared = pipeline.prepare_voice_note(&input).await.expect("prepare");

    assert!(prepared.converted);
    assert_ne!(prepared.path, input);
    assert!(is_ogg_opus(&prepared.path).await.expect("sniff"));
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn conversion_without_transcoder_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(dir.path(), None).await;
    let input = write_mp3(dir.path(), "note.mp3");

    let result = pipeline.prepare_voice_note(&input).await;

    assert!(matches!(result, Err(MediaError::TranscoderUnavailable)));
    assert!(!pipeline.has_transcoder());
}

#[tokio::test]
async fn missing_ffmpeg_binary_maps_to_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ffmpeg: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(
        dir.path().join("no-such-ffmpeg"),
        dir.path().join("out"),
        &MediaConfig::default(),
    ));
    let pipeline = pipeline(dir.path(), Some(ffmpeg)).await;
    let input = write_mp3(dir.path(), "note.mp3");

    let result = pipeline.prepare_voice_note(&input).await;

    assert!(matches!(result, Err(MediaError::TranscoderUnavailable)));
}

#[tokio::test]
async fn unreadable_input_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = pipeline(dir.path(), None).await;

    let result = pipeline
        .prepare_voice_note(&dir.path().join("absent.mp3"))
        .await;

    assert!(matches!(result, Err(MediaError::Io(_))));
}

#[test]
fn detect_ignores_missing_configured_binary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = MediaConfig {
        ffmpeg_path: Some(
            dir.path()
                .join("definitely-not-ffmpeg")
                .to_string_lossy()
                .into_owned(),
        ),
        ..MediaConfig::default()
    };
    assert!(FfmpegTranscoder::detect(&config, dir.path()).is_none());
}
