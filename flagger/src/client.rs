use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use flagger_core::configuration_fetcher::{
    ConfigurationFetcher, ConfigurationFetcherConfig, DEFAULT_FETCH_ATTEMPTS,
};
use flagger_core::configuration_store::ConfigurationStore;
use flagger_core::eval::{evaluate, FlagResult};
use flagger_core::ingestion::{Ingester, ReqwestSender, FIRST_EXPOSURES_FLUSH_COUNT};
use flagger_core::sse::{ConfigurationUpdateHandler, SseClient};
use flagger_core::{Entity, Error, Event, Exposure, Payload, Result, SdkInfo};

use crate::config::{resolve_args, InitArgs};

pub(crate) fn sdk_info() -> SdkInfo {
    SdkInfo {
        name: "rust".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    }
}

/// The Flagger client.
///
/// A `Flagger` is reentrantly constructible: tests and multi-tenant hosts
/// can spin up isolated instances with [`Flagger::new`]. Most applications
/// use the process-wide instance behind the module-level functions instead.
///
/// Before [`Flagger::init`] succeeds (and after [`Flagger::shutdown`]) the
/// client is *disabled*: flag functions return the off defaults and
/// [`Flagger::publish`]/[`Flagger::track`]/[`Flagger::set_entity`] are
/// no-ops, apart from a single silent initialization attempt from
/// environment variables.
pub struct Flagger {
    store: Arc<ConfigurationStore>,
    inner: Mutex<Option<Instance>>,
    auto_init_attempted: AtomicBool,
}

/// Everything that only exists while the client is initialized.
struct Instance {
    ingester: Ingester,
    sse: SseClient,
    stop_tx: tokio::sync::oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl Default for Flagger {
    fn default() -> Flagger {
        Flagger::new()
    }
}

impl Flagger {
    pub fn new() -> Flagger {
        Flagger {
            store: Arc::new(ConfigurationStore::new()),
            inner: Mutex::new(None),
            auto_init_attempted: AtomicBool::new(false),
        }
    }

    /// Fetch the configuration, activate ingestion, and open the SSE
    /// stream.
    ///
    /// Blocks the caller until the initial fetch completes or both sources
    /// are exhausted. Re-calling `init` first performs a one-second bounded
    /// shutdown of the previous instance.
    ///
    /// # Errors
    ///
    /// - [`flagger_core::Error::BadInitArgs`] if validation fails.
    /// - [`flagger_core::Error::ConfigurationFetchFailed`] if both the
    ///   primary and the backup sources are exhausted; the client stays
    ///   disabled.
    pub fn init(&self, args: &InitArgs) -> Result<()> {
        let resolved = resolve_args(args, &sdk_info())?;

        let mut inner = self.inner.lock().expect("flagger lock poisoned");
        if let Some(instance) = inner.take() {
            shutdown_instance(instance, Duration::from_secs(1));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let fetcher = ConfigurationFetcher::new(ConfigurationFetcherConfig {
            source_url: resolved.source_url.clone(),
            backup_source_url: resolved.backup_source_url.clone(),
            attempts: DEFAULT_FETCH_ATTEMPTS,
        })?;

        let configuration = match runtime.block_on(fetcher.fetch()) {
            Ok(configuration) => configuration,
            Err(err) => {
                self.store.set_configuration(None);
                return Err(err);
            }
        };
        let sdk_config = configuration.sdk_config.clone();
        self.store.set_configuration(Some(configuration));

        let http = Arc::new(ReqwestSender::new()?);

        // Tasks are registered on the runtime here and start making
        // progress once the background thread begins driving it.
        let (ingester, sse) = {
            let _guard = runtime.enter();

            let ingester = Ingester::spawn(
                sdk_info(),
                http,
                resolved.ingestion_url.clone(),
                sdk_config,
                FIRST_EXPOSURES_FLUSH_COUNT,
                true,
            );

            let handler: ConfigurationUpdateHandler = {
                let store = Arc::clone(&self.store);
                let ingester = ingester.clone();
                Arc::new(move |configuration| {
                    log::debug!(target: "flagger", "set new configuration");
                    ingester.set_sdk_config(configuration.sdk_config.clone());
                    store.set_configuration(Some(configuration));
                })
            };

            let sse = SseClient::spawn(handler);
            sse.set_url(resolved.sse_url.clone());

            (ingester, sse)
        };

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("flagger-runtime".to_owned())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = stop_rx.await;
                });
            })?;

        *inner = Some(Instance {
            ingester,
            sse,
            stop_tx,
            thread,
        });
        self.auto_init_attempted.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Ingest what is left, stop the ingester and close the SSE connection.
    ///
    /// Waits for the current ingestion to finish, but no longer than
    /// `timeout`. Returns `true` iff the drain timed out. Safe to call
    /// before `init` and to call repeatedly.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().expect("flagger lock poisoned");
        self.store.set_configuration(None);
        match inner.take() {
            Some(instance) => shutdown_instance(instance, timeout),
            None => false,
        }
    }

    /// Explicitly report an entity to the ingestion endpoint.
    pub fn publish(&self, entity: &Entity) {
        self.ensure_initialized();

        if entity.id.is_empty() {
            log::warn!(target: "flagger", "could not publish because entity.id is empty");
            return;
        }
        let entity = entity.escape();

        if let Some(instance) = self.inner.lock().expect("flagger lock poisoned").as_ref() {
            instance.ingester.publish(entity);
        }
    }

    /// Simple event tracking API. The event's entity is optional if a
    /// default entity was set before.
    pub fn track(&self, event: &Event) {
        self.ensure_initialized();

        if event.name.is_empty() {
            log::warn!(target: "flagger", "could not track because event.name is empty");
            return;
        }
        if let Some(entity) = &event.entity {
            if entity.id.is_empty() {
                log::warn!(target: "flagger", "could not track because event.entity.id is empty");
                return;
            }
        }
        let event = event.escape();

        if let Some(instance) = self.inner.lock().expect("flagger lock poisoned").as_ref() {
            instance.ingester.track(event);
        }
    }

    /// Store a default entity, which allows omission of the entity in other
    /// API methods. `None` clears it.
    ///
    /// If no entity was provided to Flagger in any way, flag functions
    /// resolve with the default variation and [`Flagger::track`] does not
    /// record events.
    pub fn set_entity(&self, entity: Option<&Entity>) {
        self.ensure_initialized();

        if let Some(entity) = entity {
            if entity.id.is_empty() {
                log::warn!(target: "flagger", "could not set entity because entity.id is empty");
                return;
            }
        }
        let entity = entity.map(Entity::escape);

        self.store.set_default_entity(entity.clone());
        if let Some(instance) = self.inner.lock().expect("flagger lock poisoned").as_ref() {
            instance.ingester.set_entity(entity);
        }
    }

    /// Determines if the flag is enabled for the entity.
    pub fn is_enabled(&self, codename: &str, entity: Option<&Entity>) -> bool {
        self.evaluate_with_exposure("isEnabled", codename, entity).enabled
    }

    /// Determines if the entity is within one of the flag's targeted
    /// subpopulations.
    pub fn is_sampled(&self, codename: &str, entity: Option<&Entity>) -> bool {
        self.evaluate_with_exposure("isSampled", codename, entity).sampled
    }

    /// Returns the variation assigned to the entity in a multivariate flag.
    pub fn get_variation(&self, codename: &str, entity: Option<&Entity>) -> String {
        self.evaluate_with_exposure("getVariation", codename, entity)
            .variation
            .codename
    }

    /// Returns the payload associated with the variation assigned to the
    /// entity.
    pub fn get_payload(&self, codename: &str, entity: Option<&Entity>) -> Payload {
        self.evaluate_with_exposure("getPayload", codename, entity).payload
    }

    /// Evaluate against the current configuration snapshot and report the
    /// exposure. Never blocks on network.
    fn evaluate_with_exposure(
        &self,
        method: &str,
        codename: &str,
        entity: Option<&Entity>,
    ) -> FlagResult {
        self.ensure_initialized();

        let entity = entity.map(Entity::escape);
        let configuration = self.store.configuration();
        let default_entity = self.store.default_entity();

        let result = evaluate(
            configuration.as_deref(),
            default_entity.as_deref(),
            codename,
            entity.as_ref(),
        );

        if result.reason.should_ingest() {
            if let Some(instance) = self.inner.lock().expect("flagger lock poisoned").as_ref() {
                instance.ingester.publish_exposure(
                    Exposure {
                        codename: codename.to_owned(),
                        hashkey: result.hashkey.clone(),
                        variation: result.variation.codename.clone(),
                        entity: result.entity.clone(),
                        method_called: method.to_owned(),
                        timestamp: Utc::now(),
                    },
                    result.is_new,
                );
            }
        }

        log::debug!(target: "flagger", codename, reason:serde = result.reason; "{method} evaluated");
        result
    }

    /// A disabled client makes one silent attempt to initialize itself from
    /// environment variables before serving defaults.
    fn ensure_initialized(&self) {
        if self.inner.lock().expect("flagger lock poisoned").is_some() {
            return;
        }
        if self.auto_init_attempted.swap(true, Ordering::SeqCst) {
            return;
        }

        log::debug!(target: "flagger", "attempting automatic initialization from the environment");
        if let Err(err) = self.init(&InitArgs::default()) {
            log::debug!(target: "flagger", "automatic initialization failed: {err}");
        }
    }
}

impl Drop for Flagger {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

fn shutdown_instance(instance: Instance, timeout: Duration) -> bool {
    instance.sse.stop();
    let timed_out = instance.ingester.shutdown(timeout);
    let _ = instance.stop_tx.send(());
    if let Err(err) = instance.thread.join().map_err(|_| Error::RuntimePanicked) {
        log::error!(target: "flagger", "{err}");
    }
    timed_out
}
