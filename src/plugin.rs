use crate::config::Config;
use crate::error::ApiError;
use crate::events::EventSink;
use crate::http::{ApiResponse, DanbooruClient};
use crate::registry::Registry;
use crate::services::Services;
use crate::subscriptions::{
    Dispatcher, HttpMediaProbe, KvStore, MediaProbe, MessageSender, SubscriptionStore,
};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MEDIA_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wires the client, services, registry and subscription dispatcher together
/// and owns the background dispatch task.
pub struct Plugin {
    config: Config,
    client: Arc<DanbooruClient>,
    services: Services,
    registry: Registry,
    dispatcher: Arc<Dispatcher>,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Plugin {
    /// Build everything with an HTTP media probe sharing the client's pool.
    pub fn initialize(
        config: Config,
        kv: Arc<dyn KvStore>,
        sender: Arc<dyn MessageSender>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ApiError> {
        let client = Arc::new(DanbooruClient::new(&config, events)?);
        let probe = Arc::new(HttpMediaProbe::new(client.http().clone(), MEDIA_PROBE_TIMEOUT));
        Ok(Self::assemble(config, client, kv, sender, probe))
    }

    pub fn initialize_with_probe(
        config: Config,
        kv: Arc<dyn KvStore>,
        sender: Arc<dyn MessageSender>,
        probe: Arc<dyn MediaProbe>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ApiError> {
        let client = Arc::new(DanbooruClient::new(&config, events)?);
        Ok(Self::assemble(config, client, kv, sender, probe))
    }

    fn assemble(
        config: Config,
        client: Arc<DanbooruClient>,
        kv: Arc<dyn KvStore>,
        sender: Arc<dyn MessageSender>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        for problem in config.validate() {
            warn!("config: {}", problem);
        }
        if client.is_authenticated() {
            if let Err(problem) = client.auth().validate_credentials() {
                warn!("credentials: {}", problem);
            }
        }
        let services = Services::new(client.clone());
        let store = Arc::new(SubscriptionStore::new(kv));
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            services.clone(),
            store,
            sender,
            probe,
        ));
        info!(
            "danbooru plugin initialized (base_url={}, authenticated={})",
            client.base_url(),
            client.is_authenticated()
        );
        Self {
            config,
            client,
            services,
            registry: Registry::new(),
            dispatcher,
            stop: None,
            task: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &DanbooruClient {
        &self.client
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn call(&self, service: &str, method: &str, args: Value) -> Result<ApiResponse, ApiError> {
        self.registry.call(&self.services, service, method, args).await
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the dispatcher. Returns false when disabled or already running.
    pub fn start_subscriptions(&mut self) -> bool {
        if !self.config.subscriptions.enabled {
            info!("subscriptions disabled; dispatcher not started");
            return false;
        }
        if self.is_running() {
            return false;
        }
        let (tx, rx) = watch::channel(false);
        let dispatcher = self.dispatcher.clone();
        self.task = Some(tokio::spawn(dispatcher.run(rx)));
        self.stop = Some(tx);
        true
    }

    /// Signal stop, cancel the dispatcher task and wait for it to finish.
    pub async fn terminate(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("subscription task ended abnormally: {}", e),
            }
        }
        self.client.clear_cache().await;
        info!("danbooru plugin terminated");
    }
}
