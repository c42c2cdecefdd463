//! Server-sent-events consumer that keeps the configuration live.
//!
//! After the initial fetch, the SDK holds one long-lived streaming GET to
//! the SSE endpoint. `flagConfigUpdate` frames carry a full
//! [`Configuration`] which is handed to a callback; every other frame
//! (`keepalive` included) merely proves the connection is alive and resets
//! the watchdog.

use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::{Event, Eventsource};
use futures::StreamExt;
use rand::{thread_rng, Rng};
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{Configuration, Result};

const FLAG_CONFIG_UPDATE_EVENT: &str = "flagConfigUpdate";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback invoked with every configuration received over the stream.
pub type ConfigurationUpdateHandler = Arc<dyn Fn(Configuration) + Send + Sync>;

/// Timing knobs for the SSE connection.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Maximum silence tolerated on the stream before reconnecting.
    pub keepalive_timeout: Duration,
    /// Upper bound of the randomized reconnect delay.
    pub reconnect_interval: Duration,
    /// A connection that lived shorter than this is treated as a symptom of
    /// a server-side outage and gets a jittered reconnect.
    pub stable_connection_threshold: Duration,
}

impl Default for SseConfig {
    fn default() -> SseConfig {
        SseConfig {
            keepalive_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(30),
            stable_connection_threshold: Duration::from_secs(60),
        }
    }
}

/// Handle to the background SSE consumer task.
///
/// Must be created from within a tokio runtime. The consumer stays dormant
/// until the first [`SseClient::set_url`] call.
pub struct SseClient {
    url_tx: mpsc::Sender<String>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SseClient {
    pub fn spawn(handler: ConfigurationUpdateHandler) -> SseClient {
        SseClient::spawn_with_config(handler, SseConfig::default())
    }

    pub fn spawn_with_config(handler: ConfigurationUpdateHandler, config: SseConfig) -> SseClient {
        let (url_tx, url_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(run_sse_loop(url_rx, shutdown_rx, handler, config));

        SseClient {
            url_tx,
            shutdown_tx,
            task,
        }
    }

    /// Point the consumer at a (new) URL. During either the connected or
    /// the waiting phase this causes an immediate reconnect.
    pub fn set_url(&self, url: impl Into<String>) {
        if self.url_tx.try_send(url.into()).is_err() {
            log::warn!(target: "flagger", "SSE: url change dropped, consumer is gone or busy");
        }
    }

    /// Close the stream and stop the consumer.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.try_send(());
        // Aborting closes the underlying connection promptly.
        self.task.abort();
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_sse_loop(
    mut url_rx: mpsc::Receiver<String>,
    mut shutdown_rx: mpsc::Receiver<()>,
    handler: ConfigurationUpdateHandler,
    config: SseConfig,
) {
    let client = match reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            log::error!(target: "flagger", "SSE: cannot build HTTP client: {err}");
            return;
        }
    };

    let Some(mut url) = url_rx.recv().await else {
        return;
    };

    loop {
        let mut url_changed = false;
        let mut connected_for = Duration::ZERO;

        match connect(&client, &url).await {
            Err(err) => {
                log::debug!(target: "flagger", "SSE: error {err} when connecting to {url}");
            }
            Ok(response) => {
                log::debug!(target: "flagger", "SSE: connected to {url}");
                let connected_at = Instant::now();
                let mut stream = response.bytes_stream().eventsource();
                let mut deadline = Instant::now() + config.keepalive_timeout;

                loop {
                    tokio::select! {
                        changed = url_rx.recv() => match changed {
                            Some(new_url) => {
                                url = new_url;
                                url_changed = true;
                                log::debug!(target: "flagger", "SSE: URL has changed to {url}");
                                break;
                            }
                            None => return,
                        },
                        _ = shutdown_rx.recv() => {
                            log::debug!(target: "flagger", "SSE: shut down");
                            return;
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            log::debug!(target: "flagger",
                                "SSE: keepalive timeout has expired, timeout: {:?}",
                                config.keepalive_timeout);
                            break;
                        }
                        event = stream.next() => match event {
                            None => {
                                log::debug!(target: "flagger", "SSE: connection is closed");
                                break;
                            }
                            Some(Err(err)) => {
                                log::debug!(target: "flagger", "SSE: stream error: {err}");
                                break;
                            }
                            Some(Ok(event)) => {
                                // any frame resets the watchdog
                                deadline = Instant::now() + config.keepalive_timeout;
                                process_event(&event, &handler);
                            }
                        }
                    }
                }

                connected_for = connected_at.elapsed();
            }
        }

        if url_changed {
            continue;
        }

        // A connection that died young points at a server-side outage;
        // spread the reconnects so the fleet does not stampede back in.
        let delay = if connected_for < config.stable_connection_threshold {
            thread_rng().gen_range(Duration::ZERO..config.reconnect_interval)
        } else {
            Duration::ZERO
        };

        log::debug!(target: "flagger", "SSE: waiting {delay:?} to reconnect");
        tokio::select! {
            changed = url_rx.recv() => match changed {
                Some(new_url) => {
                    url = new_url;
                    log::debug!(target: "flagger",
                        "SSE: URL has changed during reconnection phase to {url}");
                }
                None => return,
            },
            _ = shutdown_rx.recv() => {
                log::debug!(target: "flagger", "SSE: shut down");
                return;
            }
            _ = tokio::time::sleep(delay) => {
                log::debug!(target: "flagger", "SSE: reconnect interval has passed, reconnecting to {url}");
            }
        }
    }
}

async fn connect(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    // Accept-Encoding: gzip is added by the client; gzip responses are
    // decompressed transparently.
    let response = client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?;
    let response = response.error_for_status()?;
    Ok(response)
}

fn process_event(event: &Event, handler: &ConfigurationUpdateHandler) {
    if event.event != FLAG_CONFIG_UPDATE_EVENT {
        return;
    }

    log::debug!(target: "flagger", "SSE: received a configuration update");
    match serde_json::from_str::<Configuration>(&event.data) {
        Ok(configuration) => handler(configuration),
        Err(err) => {
            // Bad frames are skipped; the connection continues.
            log::warn!(target: "flagger", "SSE: json parse error: {err}, data: {}", event.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording_handler() -> (ConfigurationUpdateHandler, Arc<Mutex<Vec<Configuration>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let received = Arc::clone(&received);
            Arc::new(move |configuration| {
                received.lock().unwrap().push(configuration);
            }) as ConfigurationUpdateHandler
        };
        (handler, received)
    }

    fn frame(event: &str, data: &str) -> Event {
        Event {
            event: event.to_owned(),
            data: data.to_owned(),
            id: "ea0ba4e5-d6c6-4f4a-973a-d2a208a62ec8".to_owned(),
            retry: None,
        }
    }

    #[test]
    fn config_update_reaches_the_handler() {
        let (handler, received) = recording_handler();

        process_event(
            &frame(
                "flagConfigUpdate",
                r#"{"hashKey": "new", "flags": [{"codename": "color"}]}"#,
            ),
            &handler,
        );

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].hash_key, "new");
    }

    #[test]
    fn keepalive_frames_are_ignored() {
        let (handler, received) = recording_handler();

        process_event(&frame("keepalive", ""), &handler);

        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_update_is_skipped() {
        let (handler, received) = recording_handler();

        process_event(&frame("flagConfigUpdate", "{not json"), &handler);

        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn default_timing() {
        let config = SseConfig::default();
        assert_eq!(config.keepalive_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_interval, Duration::from_secs(30));
        assert_eq!(config.stable_connection_threshold, Duration::from_secs(60));
    }
}
