//! The batching stage of the ingestion pipeline.
//!
//! Two tasks cooperate: the *worker* owns the accumulator and decides when
//! to flush; the *sender* owns the retry queue and performs the actual
//! HTTP sends. They are connected by a bounded channel, so accumulation
//! continues while a send is in flight and batches stay in FIFO order all
//! the way to the wire.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::configuration::SdkConfig;
use crate::entity::Entity;
use crate::events::{Event, Exposure, IngestionBatch, SdkInfo};

use super::http::HttpSender;
use super::retry_queue::RetryQueue;

/// Each of this many first exposures of an SDK lifetime forces an immediate
/// flush, so that a freshly integrated application shows up server-side
/// right away.
pub const FIRST_EXPOSURES_FLUSH_COUNT: u32 = 10;

// Sized generously so publishing callers practically never block.
const PUBLISH_QUEUE_CAPACITY: usize = 4000;
const SEND_QUEUE_CAPACITY: usize = 1000;

/// One publish call's worth of ingestion data.
#[derive(Debug, Clone, Default, PartialEq)]
struct BatchFragment {
    entities: Vec<Entity>,
    exposures: Vec<Exposure>,
    events: Vec<Event>,
    detected_flags: Vec<String>,
}

enum IngesterMessage {
    Publish(BatchFragment),
    SetSdkConfig(SdkConfig),
    SetUrl(String),
    Shutdown(std::sync::mpsc::Sender<()>),
}

enum SendRequest {
    Send { body: Vec<u8>, url: String },
    Shutdown(std::sync::mpsc::Sender<()>),
}

/// Handle to the ingestion pipeline.
///
/// All methods are callable from any non-runtime thread and never block on
/// network I/O; publishing blocks only if the (generously sized) internal
/// queue is full. Cloning the handle is cheap and all clones drive the same
/// pipeline.
#[derive(Clone)]
pub struct Ingester {
    tx: mpsc::Sender<IngesterMessage>,
    state: Arc<IngesterState>,
}

struct IngesterState {
    active: AtomicBool,
    default_entity: Mutex<Option<Entity>>,
}

impl Ingester {
    /// Start the pipeline tasks on the current tokio runtime.
    ///
    /// When `send_init_ping` is set, a batch carrying nothing but a fresh id
    /// is sent immediately to register this SDK instance server-side.
    pub fn spawn(
        sdk_info: SdkInfo,
        http: Arc<dyn HttpSender>,
        ingestion_url: String,
        sdk_config: SdkConfig,
        first_exposures_threshold: u32,
        send_init_ping: bool,
    ) -> Ingester {
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);

        tokio::spawn(run_sender(send_rx, http));

        let worker = Worker {
            send_tx,
            sdk_info,
            url: ingestion_url,
            interval: sdk_config.ingestion_interval(),
            max_items: sdk_config.ingestion_max_items(),
            fragments: Vec::new(),
            publish_count: 0,
            exposures_seen: 0,
            first_exposures_threshold,
        };
        tokio::spawn(worker.run(rx, send_init_ping));

        Ingester {
            tx,
            state: Arc::new(IngesterState {
                active: AtomicBool::new(true),
                default_entity: Mutex::new(None),
            }),
        }
    }

    /// Explicitly report an entity.
    pub fn publish(&self, entity: Entity) {
        self.send(IngesterMessage::Publish(BatchFragment {
            entities: vec![entity],
            ..BatchFragment::default()
        }));
    }

    /// Report a user event. An event without an entity uses the stored
    /// default entity; with neither, the event is dropped.
    pub fn track(&self, event: Event) {
        let entity = event
            .entity
            .clone()
            .or_else(|| self.state.default_entity.lock().unwrap().clone());
        let Some(entity) = entity else {
            log::warn!(target: "flagger",
                "no entity provided, event {:?} will not be recorded", event.name);
            return;
        };

        self.send(IngesterMessage::Publish(BatchFragment {
            entities: vec![entity],
            events: vec![event],
            ..BatchFragment::default()
        }));
    }

    /// Report an exposure. An exposure without an entity uses the stored
    /// default entity; with neither, the exposure is dropped. When the flag
    /// was absent from the configuration, its codename travels along as a
    /// detected flag.
    pub fn publish_exposure(&self, mut exposure: Exposure, is_new_flag: bool) {
        if exposure.entity.is_none() {
            exposure.entity = self.state.default_entity.lock().unwrap().clone();
        }
        let Some(entity) = exposure.entity.clone() else {
            return; // have no entity
        };

        let detected_flags = if is_new_flag {
            vec![exposure.codename.clone()]
        } else {
            Vec::new()
        };

        self.send(IngesterMessage::Publish(BatchFragment {
            entities: vec![entity],
            exposures: vec![exposure],
            detected_flags,
            ..BatchFragment::default()
        }));
    }

    /// Store the default entity used by [`Ingester::track`] and
    /// [`Ingester::publish_exposure`] fallbacks. `None` clears it.
    pub fn set_entity(&self, entity: Option<Entity>) {
        *self.state.default_entity.lock().unwrap() = entity;
    }

    pub fn set_sdk_config(&self, config: SdkConfig) {
        self.notify(IngesterMessage::SetSdkConfig(config));
    }

    pub fn set_url(&self, url: String) {
        self.notify(IngesterMessage::SetUrl(url));
    }

    /// Flush what is left and wait for all queued sends to finish, but no
    /// longer than `timeout`.
    ///
    /// Returns `true` iff the drain timed out. The pipeline accepts no data
    /// afterwards either way; repeated calls return `false`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if !self.state.active.swap(false, Ordering::SeqCst) {
            return false;
        }

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        if self.tx.blocking_send(IngesterMessage::Shutdown(reply_tx)).is_err() {
            return false; // worker is already gone
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(()) => {
                log::debug!(target: "flagger", "ingestion drain finished");
                false
            }
            Err(_) => {
                log::warn!(target: "flagger", "ingestion drain exited with a timeout");
                true
            }
        }
    }

    fn send(&self, message: IngesterMessage) {
        if !self.state.active.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.blocking_send(message).is_err() {
            log::warn!(target: "flagger", "ingestion pipeline is gone, dropping data");
        }
    }

    /// Config and URL updates may arrive from the SSE task, which runs on
    /// the runtime and must not block.
    fn notify(&self, message: IngesterMessage) {
        if !self.state.active.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.try_send(message).is_err() {
            log::warn!(target: "flagger", "ingestion pipeline is busy, dropping control message");
        }
    }
}

struct Worker {
    send_tx: mpsc::Sender<SendRequest>,
    sdk_info: SdkInfo,
    url: String,
    interval: Duration,
    max_items: usize,
    fragments: Vec<BatchFragment>,
    publish_count: usize,
    exposures_seen: u32,
    first_exposures_threshold: u32,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<IngesterMessage>, send_init_ping: bool) {
        if send_init_ping {
            self.send_init_ping().await;
        }

        let mut next_flush = Instant::now() + self.interval;

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    None => {
                        // every handle is gone; flush what we have and let
                        // the sender drain by closing its channel
                        self.flush().await;
                        return;
                    }
                    Some(IngesterMessage::Publish(fragment)) => {
                        let force = self.note_fragment(&fragment);
                        self.fragments.push(fragment);
                        self.publish_count += 1;

                        if force || self.publish_count >= self.max_items {
                            self.flush().await;
                        }
                    }
                    Some(IngesterMessage::SetSdkConfig(config)) => {
                        log::debug!(target: "flagger", "new sdk config {config:?}");
                        self.interval = config.ingestion_interval();
                        self.max_items = config.ingestion_max_items();
                        next_flush = Instant::now() + self.interval;
                        if self.publish_count >= self.max_items {
                            self.flush().await;
                        }
                    }
                    Some(IngesterMessage::SetUrl(url)) => {
                        log::debug!(target: "flagger", "ingestion URL has changed to {url}");
                        self.url = url;
                    }
                    Some(IngesterMessage::Shutdown(reply)) => {
                        if self.publish_count > 0 {
                            self.flush().await;
                        }
                        let _ = self.send_tx.send(SendRequest::Shutdown(reply)).await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(next_flush) => {
                    if self.publish_count > 0 {
                        self.flush().await;
                    }
                    next_flush = Instant::now() + self.interval;
                }
            }
        }
    }

    /// Detected flags and the first exposures of this pipeline's lifetime
    /// are flushed immediately instead of waiting for a full batch.
    fn note_fragment(&mut self, fragment: &BatchFragment) -> bool {
        let mut force = !fragment.detected_flags.is_empty();

        if !fragment.exposures.is_empty() && self.exposures_seen < self.first_exposures_threshold {
            self.exposures_seen = self
                .exposures_seen
                .saturating_add(fragment.exposures.len() as u32);
            force = true;
        }

        force
    }

    async fn flush(&mut self) {
        if self.fragments.is_empty() {
            return;
        }

        let batch = assemble_batch(std::mem::take(&mut self.fragments), self.sdk_info.clone());
        self.publish_count = 0;

        match serde_json::to_vec(&batch) {
            Ok(body) => {
                let request = SendRequest::Send {
                    body,
                    url: self.url.clone(),
                };
                if self.send_tx.send(request).await.is_err() {
                    log::warn!(target: "flagger", "ingestion sender is gone, dropping batch");
                }
            }
            Err(err) => {
                log::error!(target: "flagger", "cannot serialize ingestion batch: {err}");
            }
        }
    }

    async fn send_init_ping(&mut self) {
        let ping = IngestionBatch {
            id: Uuid::new_v4().to_string(),
            sdk_info: self.sdk_info.clone(),
            ..IngestionBatch::default()
        };
        match serde_json::to_vec(&ping) {
            Ok(body) => {
                let request = SendRequest::Send {
                    body,
                    url: self.url.clone(),
                };
                let _ = self.send_tx.send(request).await;
            }
            Err(err) => {
                log::error!(target: "flagger", "cannot serialize init ping: {err}");
            }
        }
    }
}

/// The sender half of the pipeline: performs the HTTP sends one at a time
/// in arrival order, with the retry queue catching failures. Exits once a
/// shutdown request arrives or the worker goes away.
async fn run_sender(mut rx: mpsc::Receiver<SendRequest>, http: Arc<dyn HttpSender>) {
    let mut retry_queue = RetryQueue::new();

    while let Some(request) = rx.recv().await {
        match request {
            SendRequest::Send { body, url } => {
                retry_queue.deliver(http.as_ref(), &url, body, None).await;
            }
            SendRequest::Shutdown(reply) => {
                let _ = reply.send(());
                return;
            }
        }
    }
}

/// Merge accumulated fragments into one wire batch. Entities are
/// deduplicated by the `id ∥ type` composite key keeping the last-seen
/// version; exposures and events keep their publish order; detected flags
/// collapse to a set.
fn assemble_batch(fragments: Vec<BatchFragment>, sdk_info: SdkInfo) -> IngestionBatch {
    let mut entities: Vec<Entity> = Vec::new();
    let mut entity_index: HashMap<String, usize> = HashMap::new();
    let mut exposures = Vec::new();
    let mut events = Vec::new();
    let mut detected_flags: Vec<String> = Vec::new();
    let mut seen_flags: HashSet<String> = HashSet::new();

    for fragment in fragments {
        for entity in fragment.entities {
            let key = format!("{}{}", entity.id, entity.entity_type);
            match entity_index.get(&key) {
                Some(&at) => entities[at] = entity,
                None => {
                    entity_index.insert(key, entities.len());
                    entities.push(entity);
                }
            }
        }

        exposures.extend(fragment.exposures);
        events.extend(fragment.events);

        for flag in fragment.detected_flags {
            if seen_flags.insert(flag.clone()) {
                detected_flags.push(flag);
            }
        }
    }

    IngestionBatch {
        id: Uuid::new_v4().to_string(),
        entities,
        exposures,
        events,
        sdk_info,
        detected_flags,
    }
}
