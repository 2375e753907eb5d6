//! Media pipeline: lazy download into the local cache and voice-note
//! preparation for outbound sends.
//!
//! Downloads are keyed by `(chat_jid, message_id)`. Concurrent fetches of the
//! same key serialise on a per-key async lock and the second caller finds the
//! cache already populated, so each key is retrieved from the network at most
//! once.

pub mod files;
pub mod transcode;

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncReadExt as _;
use tracing::{debug, info, warn};

use crate::network::{NetworkClient, NetworkError};
use crate::store::{Store, StoreError};
use crate::types::MediaReference;

pub use self::transcode::{FfmpegTranscoder, TranscodeError, Transcoder};

/// Bytes inspected when sniffing the container format.
const SNIFF_LEN: u64 = 64;

/// Errors from the media pipeline.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The network could not supply the bytes.
    #[error("media fetch failed: {0}")]
    Fetch(#[source] NetworkError),

    /// Conversion is needed but no transcoder is available.
    #[error("transcoder unavailable")]
    TranscoderUnavailable,

    /// The transcoder ran and failed.
    #[error(transparent)]
    Transcode(TranscodeError),

    /// Metadata lookup or update failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Local file I/O failed.
    #[error("media I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of [`MediaPipeline::prepare_voice_note`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedVoiceNote {
    /// File to send.
    pub path: PathBuf,
    /// Whether the file was produced by the transcoder.
    pub converted: bool,
}

type Key = (String, String);
type InflightMap = Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>;

fn lock(map: &InflightMap) -> MutexGuard<'_, HashMap<Key, Arc<tokio::sync::Mutex<()>>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Membership in a key's in-flight group. The map entry goes away when the
/// last member leaves.
struct Inflight<'a> {
    map: &'a InflightMap,
    key: Key,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> Inflight<'a> {
    fn join(map: &'a InflightMap, key: Key) -> Self {
        let gate = Arc::clone(lock(map).entry(key.clone()).or_default());
        Self { map, key, gate }
    }
}

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        let mut map = lock(self.map);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.gate) <= 2 {
            map.remove(&self.key);
        }
    }
}

/// Download and transcoding front end.
pub struct MediaPipeline {
    store: Store,
    client: Arc<dyn NetworkClient>,
    cache_dir: PathBuf,
    transcoder: Option<Arc<dyn Transcoder>>,
    inflight: InflightMap,
}

impl std::fmt::Debug for MediaPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPipeline")
            .field("cache_dir", &self.cache_dir)
            .field("transcoder", &self.transcoder.is_some())
            .finish_non_exhaustive()
    }
}

impl MediaPipeline {
    /// Pipeline caching into `cache_dir`, with no transcoder.
    pub fn new(store: Store, client: Arc<dyn NetworkClient>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            client,
            cache_dir: cache_dir.into(),
            transcoder: None,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a transcoder for voice notes.
    #[must_use]
    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    /// Root of the download cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Whether non-Opus audio can be converted.
    pub fn has_transcoder(&self) -> bool {
        self.transcoder.is_some()
    }

    /// Deterministic cache location for a message's media.
    pub fn cache_path(&self, chat_jid: &str, message_id: &str, media: &MediaReference) -> PathBuf {
        let ext = files::extension_for(&media.mime_type, media.file_name.as_deref());
        self.cache_dir
            .join(files::sanitize_filename(chat_jid))
            .join(format!("{}.{ext}", files::sanitize_filename(message_id)))
    }

    /// Local path of a message's media, downloading it on first use.
    ///
    /// Returns `Ok(None)` when the message does not exist or has no media.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Fetch`] if the network cannot supply the bytes,
    /// or a storage / I/O error if caching fails.
    pub async fn fetch(
        &self,
        chat_jid: &str,
        message_id: &str,
    ) -> Result<Option<PathBuf>, MediaError> {
        let Some(reference) = self.store.media_reference(chat_jid, message_id).await? else {
            return Ok(None);
        };
        if let Some(path) = cached(&reference).await {
            debug!(chat = chat_jid, id = message_id, "media cache hit");
            return Ok(Some(path));
        }

        let inflight = Inflight::join(&self.inflight, (chat_jid.to_owned(), message_id.to_owned()));
        let _permit = inflight.gate.lock().await;

        // Whoever held the gate before us may have finished the job.
        let Some(reference) = self.store.media_reference(chat_jid, message_id).await? else {
            return Ok(None);
        };
        if let Some(path) = cached(&reference).await {
            debug!(chat = chat_jid, id = message_id, "media fetched by concurrent caller");
            return Ok(Some(path));
        }

        let bytes = self
            .client
            .fetch_media(&reference.locator)
            .await
            .map_err(MediaError::Fetch)?;

        // A pruned file is restored where the record already points.
        let path = reference
            .local_path
            .clone()
            .unwrap_or_else(|| self.cache_path(chat_jid, message_id, &reference));
        write_atomically(&path, &bytes).await?;
        if reference.local_path.is_none() {
            self.store
                .set_media_local_path(chat_jid, message_id, path.clone())
                .await?;
        }
        info!(
            chat = chat_jid,
            id = message_id,
            bytes = bytes.len(),
            path = %path.display(),
            "media downloaded"
        );
        Ok(Some(path))
    }

    /// Make `path` sendable as a voice note.
    ///
    /// Ogg/Opus input is returned unchanged; anything else goes through the
    /// transcoder.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::TranscoderUnavailable`] when conversion is
    /// needed and no transcoder is configured, [`MediaError::Transcode`] if
    /// conversion fails, or [`MediaError::Io`] if the input cannot be read.
    pub async fn prepare_voice_note(&self, path: &Path) -> Result<PreparedVoiceNote, MediaError> {
        if is_ogg_opus(path).await? {
            debug!(path = %path.display(), "input already ogg/opus");
            return Ok(PreparedVoiceNote {
                path: path.to_path_buf(),
                converted: false,
            });
        }
        let Some(transcoder) = &self.transcoder else {
            warn!(path = %path.display(), "voice note needs conversion but no transcoder is available");
            return Err(MediaError::TranscoderUnavailable);
        };
        match transcoder.convert(path).await {
            Ok(converted) => {
                info!(input = %path.display(), output = %converted.display(), "voice note transcoded");
                Ok(PreparedVoiceNote {
                    path: converted,
                    converted: true,
                })
            }
            Err(TranscodeError::Unavailable(binary)) => {
                warn!(%binary, "transcoder disappeared");
                Err(MediaError::TranscoderUnavailable)
            }
            Err(e) => Err(MediaError::Transcode(e)),
        }
    }
}

/// Stored local path, if the file is still there.
async fn cached(reference: &MediaReference) -> Option<PathBuf> {
    let path = reference.local_path.as_ref()?;
    match tokio::fs::try_exists(path).await {
        Ok(true) => Some(path.clone()),
        _ => None,
    }
}

/// Write through a sibling `.part` file and rename into place.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut part: OsString = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    tokio::fs::write(&part, bytes).await?;
    tokio::fs::rename(&part, path).await
}

/// Sniff the file header for an Ogg container carrying Opus.
pub async fn is_ogg_opus(path: &Path) -> std::io::Result<bool> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::new();
    file.take(SNIFF_LEN).read_to_end(&mut head).await?;
    Ok(head.starts_with(b"OggS") && head.windows(8).any(|w| w == b"OpusHead"))
}
