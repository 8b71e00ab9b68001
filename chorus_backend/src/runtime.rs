use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::FleetConfig;
use crate::database::FleetDatabase;
use crate::fleet::handle::{serve_commands, FleetHandle};
use crate::fleet::{FleetEvent, FleetManager};
use crate::http_client::build_http_client;
use crate::llm_client::{GenerationBackend, LlmClient};
use crate::messaging::matrix::MatrixBackend;
use crate::messaging::MessagingBackend;

const GENERATION_TIMEOUT: Duration = Duration::from_secs(180);

pub struct BackendRuntime {
    pub config: FleetConfig,
    pub database: Arc<FleetDatabase>,
    pub fleet: Arc<FleetManager>,
}

pub struct BackendRuntimeBuilder {
    config: FleetConfig,
    event_tx: Sender<FleetEvent>,
    messaging: Option<Arc<dyn MessagingBackend>>,
    generation: Option<Arc<dyn GenerationBackend>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: FleetConfig, event_tx: Sender<FleetEvent>) -> Self {
        Self {
            config,
            event_tx,
            messaging: None,
            generation: None,
        }
    }

    /// Use another messaging adapter instead of Matrix.
    pub fn with_messaging(mut self, messaging: Arc<dyn MessagingBackend>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    pub fn with_generation(mut self, generation: Arc<dyn GenerationBackend>) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let database = Arc::new(
            FleetDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database {}", config.database_path))?,
        );

        let messaging: Arc<dyn MessagingBackend> = match self.messaging {
            Some(messaging) => messaging,
            None => {
                if config.admin_token.is_none() {
                    tracing::warn!(
                        "No MATRIX_ADMIN_TOKEN configured; spawning and despawning will fail"
                    );
                }
                let client = build_http_client(None)?;
                Arc::new(MatrixBackend::new(
                    &config.homeserver_url,
                    config.server_name.clone(),
                    config.admin_token.clone(),
                    client,
                )?)
            }
        };

        let generation: Arc<dyn GenerationBackend> = match self.generation {
            Some(generation) => generation,
            None => {
                let client = build_http_client(Some(GENERATION_TIMEOUT))?;
                Arc::new(LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    config.llm_model.clone(),
                    config.image_model.clone(),
                    client,
                ))
            }
        };

        tracing::info!(
            "Fleet backend: homeserver {} ({}), model {} at {}",
            config.homeserver_url,
            config.server_name,
            config.llm_model,
            config.llm_api_url
        );

        let fleet = Arc::new(FleetManager::new(
            messaging,
            generation,
            database.clone(),
            database.clone(),
            &config,
            self.event_tx,
        ));

        Ok(BackendRuntime {
            config,
            database,
            fleet,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: FleetConfig, event_tx: Sender<FleetEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Restore stored personas, then serve fleet commands until every handle
    /// is dropped or the fleet's shutdown token fires, then shut the fleet down.
    pub async fn run(&self, requests: flume::Receiver<crate::fleet::handle::FleetRequest>) {
        if let Err(e) = self.fleet.restore_all().await {
            tracing::error!("Failed to restore personas: {}", e);
        }
        serve_commands(self.fleet.clone(), requests).await;
        self.fleet.shutdown().await;
    }

    /// Run the fleet on its own OS thread with a dedicated tokio runtime.
    pub fn spawn_fleet_thread(self) -> Result<(FleetHandle, JoinHandle<()>)> {
        let (handle, requests) = FleetHandle::channel();
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("chorus-fleet")
            .build()
            .context("Failed to start fleet runtime")?;

        let thread = std::thread::Builder::new()
            .name("chorus-fleet-main".to_string())
            .spawn(move || {
                rt.block_on(self.run(requests));
            })
            .context("Failed to spawn fleet thread")?;

        Ok((handle, thread))
    }
}
