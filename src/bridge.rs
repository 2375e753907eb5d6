//! Bridge assembly: owns every component and their lifetimes.
//!
//! Nothing here is global. [`Bridge::open`] builds the store, session,
//! media pipeline and services from configuration; [`Bridge::start`] begins
//! ingestion and connects; [`Bridge::shutdown`] tears it all down in order.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::commands::CommandService;
use crate::config::{Config, RuntimePaths};
use crate::ingest::{Dispatcher, IngestStats};
use crate::media::{FfmpegTranscoder, MediaPipeline, Transcoder};
use crate::network::NetworkClient;
use crate::query::QueryService;
use crate::session::{ConnectionState, CredentialStore, SessionError, SessionManager};
use crate::store::Store;

/// The running bridge service.
#[derive(Debug)]
pub struct Bridge {
    store: Store,
    session: Arc<SessionManager>,
    media: Arc<MediaPipeline>,
    commands: CommandService,
    queries: QueryService,
    dispatcher: Dispatcher,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Build every component, locating ffmpeg on the way.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime directories or the database cannot be
    /// created.
    pub async fn open(
        config: &Config,
        paths: &RuntimePaths,
        client: Arc<dyn NetworkClient>,
    ) -> anyhow::Result<Self> {
        let transcoder = FfmpegTranscoder::detect(&config.media, &paths.outbox_dir)
            .map(|t| Arc::new(t) as Arc<dyn Transcoder>);
        if transcoder.is_none() {
            info!("ffmpeg not found; voice notes accept ogg/opus input only");
        }
        Self::open_with(config, paths, client, transcoder).await
    }

    /// Build every component with an explicit transcoder (or none).
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime directories or the database cannot be
    /// created.
    pub async fn open_with(
        config: &Config,
        paths: &RuntimePaths,
        client: Arc<dyn NetworkClient>,
        transcoder: Option<Arc<dyn Transcoder>>,
    ) -> anyhow::Result<Self> {
        for dir in [&paths.root, &paths.media_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let store = Store::open(&paths.database)
            .await
            .with_context(|| format!("failed to open {}", paths.database.display()))?;

        let session = SessionManager::new(
            Arc::clone(&client),
            CredentialStore::new(&paths.credential_file),
            config.session.clone(),
        );

        let mut media = MediaPipeline::new(store.clone(), client, &paths.media_dir);
        if let Some(transcoder) = transcoder {
            media = media.with_transcoder(transcoder);
        }
        let media = Arc::new(media);

        let commands = CommandService::new(
            Arc::clone(&session),
            Arc::clone(&media),
            store.clone(),
            Duration::from_secs(config.commands.timeout_secs),
        );
        let queries = QueryService::new(store.clone());
        let dispatcher = Dispatcher::new(store.clone());

        info!(root = %paths.root.display(), "bridge assembled");
        Ok(Self {
            store,
            session,
            media,
            commands,
            queries,
            dispatcher,
            ingest_task: Mutex::new(None),
        })
    }

    /// Start ingestion, then connect (pairing if needed).
    ///
    /// Returns once the first session is up.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge was already started or authentication
    /// fails terminally.
    pub async fn start(&self) -> Result<(), SessionError> {
        let events = self.session.events()?;
        let task = self.dispatcher.clone().spawn(events);
        *self
            .ingest_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        self.session.connect().await
    }

    /// Agent-facing send and download commands.
    pub fn commands(&self) -> &CommandService {
        &self.commands
    }

    /// Agent-facing read queries.
    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    /// The session manager.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// The media pipeline.
    pub fn media(&self) -> &Arc<MediaPipeline> {
        &self.media
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Pairing codes to show the operator (taken once).
    pub fn pairing_codes(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.session.pairing_codes()
    }

    /// Connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.subscribe_state()
    }

    /// Ingestion counters.
    pub fn ingest_stats(&self) -> Arc<IngestStats> {
        self.dispatcher.stats()
    }

    /// Stop the session, then ingestion, then close the database.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
        let task = self
            .ingest_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            // Cancellation is the expected outcome here.
            let _ = task.await;
        }
        self.store.close().await;
        info!("bridge stopped");
    }
}
