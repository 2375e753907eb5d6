//! Shared fixtures: a scripted in-process network client, a fake
//! transcoder, and message builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use wabridge::config::SessionConfig;
use wabridge::media::{TranscodeError, Transcoder};
use wabridge::network::{
    Ack, AuthError, Connected, Credential, EventStream, IncomingMessage, MediaAttachment,
    NetworkClient, NetworkError, NetworkEvent, OutboundPayload, PairingSink, SessionHandle,
};
use wabridge::session::{CredentialStore, SessionManager};
use wabridge::store::Store;
use wabridge::types::{ContentKind, DeliveryStatus};

/// Credential handed out after a fake pairing.
pub const PAIRED_CREDENTIAL: &[u8] = b"paired-credential";

/// Pairing code published when connecting without a credential.
pub const PAIRING_CODE: &str = "2@fake-qr";

/// Device JID reported by the fake network.
pub const DEVICE_JID: &str = "15550001111:7@s.whatsapp.net";

/// Scripted [`NetworkClient`]. Unscripted connects succeed.
#[derive(Default)]
pub struct FakeNetwork {
    connect_script: Mutex<VecDeque<Result<(), AuthError>>>,
    connect_calls: Mutex<Vec<Option<Vec<u8>>>>,
    streams: Mutex<Vec<mpsc::Sender<NetworkEvent>>>,
    stream_count: AtomicUsize,
    sends: Mutex<Vec<(String, OutboundPayload)>>,
    send_delay: Mutex<Duration>,
    reject_sends: Mutex<Option<String>>,
    media: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    fetches: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    next_id: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue connect outcomes; `Ok(())` means a normal success.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = Result<(), AuthError>>) {
        self.connect_script.lock().expect("lock").extend(outcomes);
    }

    /// Credentials passed to each connect call, in order.
    pub fn connect_calls(&self) -> Vec<Option<Vec<u8>>> {
        self.connect_calls.lock().expect("lock").clone()
    }

    /// Number of event streams opened so far.
    pub fn stream_count(&self) -> usize {
        self.stream_count.load(Ordering::SeqCst)
    }

    /// Wait up to two seconds for `n` event streams to have been opened.
    pub async fn wait_for_streams(&self, n: usize) -> bool {
        for _ in 0..200 {
            if self.stream_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Push an event into the newest open stream.
    pub async fn emit(&self, event: NetworkEvent) {
        let sender = self
            .streams
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .expect("an event stream should be open");
        sender.send(event).await.expect("stream consumer alive");
    }

    /// End every open stream, as a transport drop would.
    pub fn drop_connection(&self) {
        self.streams.lock().expect("lock").clear();
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().expect("lock") = delay;
    }

    pub fn reject_sends(&self, reason: &str) {
        *self.reject_sends.lock().expect("lock") = Some(reason.to_owned());
    }

    /// Sends the network accepted or rejected, in transmission order.
    pub fn sends(&self) -> Vec<(String, OutboundPayload)> {
        self.sends.lock().expect("lock").clone()
    }

    /// Make `bytes` downloadable under `locator`.
    pub fn put_media(&self, locator: &[u8], bytes: &[u8]) {
        self.media
            .lock()
            .expect("lock")
            .insert(locator.to_vec(), bytes.to_vec());
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().expect("lock") = delay;
    }

    /// Number of `fetch_media` calls so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkClient for FakeNetwork {
    async fn connect(
        &self,
        credential: Option<&Credential>,
        pairing: &PairingSink,
    ) -> Result<Connected, AuthError> {
        self.connect_calls
            .lock()
            .expect("lock")
            .push(credential.map(|c| c.as_bytes().to_vec()));
        let scripted = self.connect_script.lock().expect("lock").pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }
        let fresh = if credential.is_none() {
            let _ = pairing.send(PAIRING_CODE.to_owned());
            Some(Credential::new(PAIRED_CREDENTIAL.to_vec()))
        } else {
            None
        };
        let n = self.connect_calls.lock().expect("lock").len();
        Ok(Connected {
            handle: SessionHandle {
                id: format!("session-{n}"),
                device_jid: Some(DEVICE_JID.to_owned()),
            },
            credential: fresh,
        })
    }

    async fn events(&self, _handle: &SessionHandle) -> Result<EventStream, NetworkError> {
        let (tx, rx) = mpsc::channel(64);
        self.streams.lock().expect("lock").push(tx);
        self.stream_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(
        &self,
        _handle: &SessionHandle,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<Ack, NetworkError> {
        let delay = *self.send_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.sends
            .lock()
            .expect("lock")
            .push((to.to_owned(), payload.clone()));
        if let Some(reason) = self.reject_sends.lock().expect("lock").clone() {
            return Err(NetworkError::Rejected(reason));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Ack {
            message_id: format!("SENT-{n}"),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_media(&self, locator: &[u8]) -> Result<Vec<u8>, NetworkError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.media
            .lock()
            .expect("lock")
            .get(locator)
            .cloned()
            .ok_or_else(|| NetworkError::MediaUnavailable("locator expired".to_owned()))
    }
}

/// Transcoder that writes a minimal Ogg/Opus file into `output_dir`.
pub struct FakeTranscoder {
    pub output_dir: PathBuf,
    pub calls: AtomicUsize,
    delay: Duration,
}

impl FakeTranscoder {
    pub fn new(output_dir: &Path) -> Arc<Self> {
        Self::slow(output_dir, Duration::ZERO)
    }

    /// Transcoder that takes `delay` per conversion.
    pub fn slow(output_dir: &Path, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            output_dir: output_dir.to_path_buf(),
            calls: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn convert(&self, input: &Path) -> Result<PathBuf, TranscodeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = self.output_dir.join(format!("{stem}-{n}.ogg"));
        tokio::fs::write(&output, ogg_opus_bytes()).await?;
        Ok(output)
    }
}

/// Bytes that sniff as Ogg/Opus.
pub fn ogg_opus_bytes() -> Vec<u8> {
    let mut bytes = b"OggS".to_vec();
    bytes.extend_from_slice(&[0u8; 24]);
    bytes.extend_from_slice(b"OpusHead");
    bytes.extend_from_slice(&[1u8; 16]);
    bytes
}

/// Write an Ogg/Opus file into `dir`.
pub fn write_opus(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, ogg_opus_bytes()).expect("write opus fixture");
    path
}

/// Write an MP3-looking file into `dir`.
pub fn write_mp3(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"ID3\x03\x00\x00\x00\x00\x00\x00audio").expect("write mp3 fixture");
    path
}

/// Session config with millisecond backoff so reconnect tests run fast.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 10,
        max_auth_attempts: 2,
        event_buffer: 64,
        send_queue: 16,
    }
}

/// Session manager over `network` with its credential in `dir`.
pub fn session_manager(network: &Arc<FakeNetwork>, dir: &Path) -> Arc<SessionManager> {
    let client: Arc<dyn NetworkClient> = Arc::clone(network) as Arc<dyn NetworkClient>;
    SessionManager::new(
        client,
        CredentialStore::new(dir.join("credential")),
        fast_session_config(),
    )
}

pub async fn memory_store() -> Store {
    Store::in_memory().await.expect("in-memory store should open")
}

/// Deterministic timestamp `minute` minutes into a fixed day.
pub fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .and_then(|base| base.checked_add_signed(chrono::Duration::minutes(i64::from(minute))))
        .expect("valid date")
}

/// Inbound text message event payload.
pub fn text_message(chat: &str, id: &str, sender: &str, minute: u32, text: &str) -> IncomingMessage {
    IncomingMessage {
        chat_jid: chat.to_owned(),
        chat_name: None,
        message_id: id.to_owned(),
        sender: sender.to_owned(),
        sender_name: None,
        timestamp: ts(minute),
        from_me: false,
        kind: ContentKind::Text,
        text: Some(text.to_owned()),
        media: None,
        status: None,
    }
}

/// Same key with an explicit status.
pub fn with_status(mut message: IncomingMessage, status: DeliveryStatus) -> IncomingMessage {
    message.status = Some(status);
    message
}

/// Inbound image message with a downloadable locator.
pub fn image_message(chat: &str, id: &str, minute: u32, locator: &[u8]) -> IncomingMessage {
    IncomingMessage {
        kind: ContentKind::Image,
        text: Some("caption".to_owned()),
        media: Some(MediaAttachment {
            locator: locator.to_vec(),
            mime_type: "image/jpeg".to_owned(),
            file_name: Some("photo.jpg".to_owned()),
            size: Some(4),
        }),
        ..text_message(chat, id, "4915112345678@s.whatsapp.net", minute, "")
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
