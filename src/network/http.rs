//! HTTP client for the protocol sidecar.
//!
//! The sidecar (a baileys/whatsmeow process) owns pairing, encryption and the
//! WebSocket to WhatsApp. It exposes session setup, sends and media download as
//! JSON endpoints, and inbound traffic through `/events/poll` long-polling.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{
    Ack, AuthError, Connected, Credential, EventStream, NetworkClient, NetworkError,
    NetworkEvent, OutboundPayload, PairingSink, SessionHandle,
};
use crate::config::NetworkConfig;

/// Buffer between the poll task and the event stream consumer.
const EVENT_BUFFER: usize = 256;

/// Delay before re-polling after a non-200 poll response.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay between pairing status checks.
const PAIRING_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Client for the sidecar HTTP API.
pub struct HttpNetworkClient {
    client: reqwest::Client,
    poll_client: reqwest::Client,
    base_url: String,
    pairing_timeout: Duration,
}

impl std::fmt::Debug for HttpNetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetworkClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Response envelope from the sidecar.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Session setup reply.
#[derive(Debug, Deserialize)]
struct SessionReply {
    state: SessionReplyState,
    session_id: String,
    #[serde(default)]
    device_jid: Option<String>,
    #[serde(default)]
    credential: Option<Credential>,
    #[serde(default)]
    qr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SessionReplyState {
    Connected,
    Pairing,
}

impl HttpNetworkClient {
    /// Create a client from the `[network]` configuration section.
    pub fn new(config: &NetworkConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        let poll_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.poll_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build poll client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            poll_client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            pairing_timeout: Duration::from_secs(config.pairing_timeout_secs),
        }
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn open_session(
        &self,
        credential: Option<&Credential>,
    ) -> Result<SessionReply, AuthError> {
        let url = format!("{}/session", self.base_url);
        let body = serde_json::json!({ "credential": credential });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        read_session_reply(resp).await
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionReply, AuthError> {
        let url = format!("{}/session/{session_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        read_session_reply(resp).await
    }
}

async fn read_session_reply(resp: reqwest::Response) -> Result<SessionReply, AuthError> {
    let status = resp.status();
    let body: BridgeResponse<SessionReply> = resp
        .json()
        .await
        .map_err(|e| AuthError::Transport(format!("malformed session reply ({status}): {e}")))?;
    match (body.data, body.error) {
        (Some(reply), _) => Ok(reply),
        (None, Some(code)) => Err(classify_auth_error(&code)),
        (None, None) => Err(AuthError::Transport(format!(
            "empty session reply ({status})"
        ))),
    }
}

/// Map a sidecar error code onto the auth taxonomy.
fn classify_auth_error(code: &str) -> AuthError {
    match code {
        "invalid_credential" | "bad_credential" => AuthError::InvalidCredential,
        "device_limit" => AuthError::DeviceLimit,
        "logged_out" | "revoked" => AuthError::Revoked(code.to_owned()),
        "pairing_expired" => AuthError::PairingExpired,
        other => AuthError::Transport(other.to_owned()),
    }
}

#[async_trait]
impl NetworkClient for HttpNetworkClient {
    async fn connect(
        &self,
        credential: Option<&Credential>,
        pairing: &PairingSink,
    ) -> Result<Connected, AuthError> {
        let mut reply = self.open_session(credential).await?;
        let deadline = tokio::time::Instant::now().checked_add(self.pairing_timeout);
        let mut last_qr: Option<String> = None;

        while reply.state == SessionReplyState::Pairing {
            if let Some(qr) = reply.qr.take() {
                if last_qr.as_deref() != Some(qr.as_str()) {
                    info!(session = %reply.session_id, "pairing code issued");
                    // Nobody rendering codes is not an error for the session itself.
                    let _ = pairing.send(qr.clone());
                    last_qr = Some(qr);
                }
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Err(AuthError::PairingExpired);
            }
            tokio::time::sleep(PAIRING_POLL_INTERVAL).await;
            reply = self.session_status(&reply.session_id).await?;
        }

        info!(session = %reply.session_id, device = ?reply.device_jid, "sidecar session connected");
        Ok(Connected {
            handle: SessionHandle {
                id: reply.session_id,
                device_jid: reply.device_jid,
            },
            credential: reply.credential,
        })
    }

    async fn events(&self, handle: &SessionHandle) -> Result<EventStream, NetworkError> {
        let poll_url = format!("{}/events/poll?session={}", self.base_url, handle.id);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.poll_client.clone();

        tokio::spawn(async move {
            match poll_events(&client, &poll_url, &tx).await {
                Ok(()) => debug!("event poll loop finished"),
                Err(e) => {
                    warn!(error = %e, "event stream lost");
                    let _ = tx
                        .send(NetworkEvent::Disconnected {
                            reason: Some(e.to_string()),
                        })
                        .await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(
        &self,
        handle: &SessionHandle,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<Ack, NetworkError> {
        let url = format!("{}/send", self.base_url);
        let body = match payload {
            OutboundPayload::Text { body } => serde_json::json!({
                "session": handle.id,
                "recipient": to,
                "text": body,
            }),
            OutboundPayload::Media {
                path,
                kind,
                mime_type,
                file_name,
                voice_note,
            } => serde_json::json!({
                "session": handle.id,
                "recipient": to,
                "media_path": path,
                "kind": kind,
                "mime_type": mime_type,
                "file_name": file_name,
                "voice_note": voice_note,
            }),
        };

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::GONE {
            return Err(NetworkError::SessionClosed);
        }
        let envelope: BridgeResponse<Ack> = resp.json().await?;
        match envelope.data {
            Some(ack) if status.is_success() => {
                debug!(recipient = to, message_id = %ack.message_id, "message sent via sidecar");
                Ok(ack)
            }
            _ => {
                let reason = envelope
                    .error
                    .unwrap_or_else(|| format!("sidecar returned {status}"));
                warn!(%status, recipient = to, "sidecar send failed: {reason}");
                Err(NetworkError::Rejected(reason))
            }
        }
    }

    async fn fetch_media(&self, locator: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let url = format!("{}/media/download", self.base_url);
        let body = serde_json::json!({ "locator": STANDARD.encode(locator) });
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let reason = resp.text().await.unwrap_or_default();
            return Err(NetworkError::MediaUnavailable(format!("{status}: {reason}")));
        }
        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Poll the sidecar for events until the consumer goes away or the
/// connection fails. Long-poll timeouts are normal and simply re-poll.
async fn poll_events(
    client: &reqwest::Client,
    poll_url: &str,
    event_tx: &mpsc::Sender<NetworkEvent>,
) -> Result<(), NetworkError> {
    loop {
        match client.get(poll_url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::GONE => {
                return Err(NetworkError::SessionClosed);
            }
            Ok(resp) if resp.status().is_success() => {
                let events = match resp.json::<Vec<NetworkEvent>>().await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "discarding undecodable event batch");
                        continue;
                    }
                };
                for event in events {
                    let ends_stream = matches!(
                        event,
                        NetworkEvent::Disconnected { .. } | NetworkEvent::LoggedOut { .. }
                    );
                    if event_tx.send(event).await.is_err() {
                        // Receiver dropped; shut down cleanly.
                        return Ok(());
                    }
                    if ends_stream {
                        return Ok(());
                    }
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
