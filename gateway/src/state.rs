use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::core::control::{AmiClient, CallControl};
use crate::core::directory::Directory;
use crate::core::history::{BroadcastHistory, CallHistory};
use crate::core::notify::EventNotifier;
use crate::core::service::{PhoneService, ServiceParts};
use crate::core::tts::{HttpSynthesizer, Synthesizer, TtsCache, UnavailableSynthesizer};
use crate::errors::CallResult;

const PEER_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Application state shared across request handlers
pub struct AppState {
    pub config: ServerConfig,
    pub service: PhoneService,
    client: Option<Arc<AmiClient>>,
}

impl AppState {
    /// Build every component from configuration and connect to the manager.
    pub async fn new(config: ServerConfig) -> CallResult<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENT_CHANNEL_CAPACITY);
        let client = Arc::new(AmiClient::spawn(config.ami_client_config(), events_tx));

        let history = match &config.history_path {
            Some(path) => {
                info!(path = %path.display(), "Opening call history");
                CallHistory::open(path).await?
            }
            None => CallHistory::in_memory(),
        };
        let broadcast_history = match &config.broadcast_history_path {
            Some(path) => {
                info!(path = %path.display(), "Opening broadcast history");
                BroadcastHistory::open(path).await?
            }
            None => BroadcastHistory::in_memory(),
        };

        let notifier = match config.notifier_config() {
            Some(notifier_config) => {
                info!(url = %notifier_config.url, "Firing events to home automation API");
                EventNotifier::new(notifier_config)?
            }
            None => EventNotifier::disabled(),
        };

        let synthesizer: Arc<dyn Synthesizer> = match &config.tts.endpoint {
            Some(endpoint) => Arc::new(HttpSynthesizer::new(
                endpoint.clone(),
                config.tts.token.clone(),
                Duration::from_secs(config.tts.request_timeout_secs),
            )?),
            None => {
                warn!("TTS endpoint not configured; only recordings can be played");
                Arc::new(UnavailableSynthesizer)
            }
        };
        let cache = Arc::new(TtsCache::open(config.tts_cache_config(), synthesizer).await?);

        let directory = Directory::new(config.groups.clone(), config.extensions.clone())?;

        let control: Arc<dyn CallControl> = client.clone();
        let service = PhoneService::start(ServiceParts {
            engine: config.engine_config(),
            control,
            peer_events: events_rx,
            cache,
            history,
            broadcast_history,
            notifier,
            directory,
            default_caller_id: config.dialing.default_caller_id.clone(),
        });

        Ok(Arc::new(Self {
            config,
            service,
            client: Some(client),
        }))
    }

    /// Wrap an already-started service. The caller owns the control client.
    pub fn with_service(config: ServerConfig, service: PhoneService) -> Arc<Self> {
        Arc::new(Self {
            config,
            service,
            client: None,
        })
    }

    /// Flush history and close the manager session.
    pub async fn shutdown(&self) {
        self.service.call_history().flush().await;
        self.service.broadcast_history().flush().await;
        if let Some(client) = &self.client {
            client.shutdown().await;
        }
    }
}
