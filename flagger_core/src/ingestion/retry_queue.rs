//! A byte-bounded FIFO of serialized batches that failed to send.
//!
//! Delivery is at-most-once: the queue lives in memory only and is lost on
//! process exit. On the next successful send the queue drains from the
//! head, stopping at the first failure. When a new payload does not fit,
//! the oldest entries are evicted until it does.

use std::collections::VecDeque;

use crate::{Error, Result};

use super::http::HttpSender;

/// Default capacity in bytes, counting [`ENTRY_OVERHEAD_BYTES`] per entry.
const DEFAULT_MAX_BYTES: usize = 200_000_000;

/// Bookkeeping overhead charged per queued entry.
const ENTRY_OVERHEAD_BYTES: usize = 24;

/// Optional completion signal attached to a payload: called with `Ok(())`
/// once the payload reaches the server, or with
/// [`Error::QueueOverflow`] when it is evicted to make room (or was too
/// large to ever fit).
pub(crate) type DeliverySignal = Box<dyn FnOnce(Result<()>) + Send>;

struct Entry {
    body: Vec<u8>,
    signal: Option<DeliverySignal>,
}

pub(crate) struct RetryQueue {
    max_bytes: usize,
    current_bytes: usize,
    queue: VecDeque<Entry>,
}

fn entry_size(body: &[u8]) -> usize {
    ENTRY_OVERHEAD_BYTES + body.len()
}

impl RetryQueue {
    pub fn new() -> RetryQueue {
        RetryQueue::with_max_bytes(DEFAULT_MAX_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> RetryQueue {
        RetryQueue {
            max_bytes,
            current_bytes: 0,
            queue: VecDeque::new(),
        }
    }

    /// Try to send `body`. On failure the payload is remembered for later;
    /// on success the backlog is drained head-first until a send fails.
    pub async fn deliver(
        &mut self,
        sender: &dyn HttpSender,
        url: &str,
        body: Vec<u8>,
        signal: Option<DeliverySignal>,
    ) {
        match sender.post(&body, url).await {
            Err(err) => {
                log::warn!(target: "flagger", "ingestion failed, queueing payload for retry: {err}");
                self.remember(body, signal);
            }
            Ok(()) => {
                if let Some(signal) = signal {
                    signal(Ok(()));
                }
                // server is up
                self.drain(sender, url).await;
            }
        }
    }

    fn remember(&mut self, body: Vec<u8>, signal: Option<DeliverySignal>) {
        let size = entry_size(&body);

        if size > self.max_bytes {
            log::warn!(target: "flagger",
                "ingestion payload is too large to retry, size: {size}, max size: {}",
                self.max_bytes);
            if let Some(signal) = signal {
                signal(Err(Error::QueueOverflow));
            }
            return;
        }

        // evict oldest entries until the new payload fits
        while self.current_bytes + size >= self.max_bytes {
            let Some(evicted) = self.queue.pop_front() else {
                break;
            };
            self.current_bytes -= entry_size(&evicted.body);
            log::warn!(target: "flagger", "retry queue is full, dropping the oldest payload");
            if let Some(signal) = evicted.signal {
                signal(Err(Error::QueueOverflow));
            }
        }

        self.current_bytes += size;
        self.queue.push_back(Entry { body, signal });
    }

    async fn drain(&mut self, sender: &dyn HttpSender, url: &str) {
        while !self.queue.is_empty() {
            let delivered = {
                let entry = &self.queue[0];
                sender.post(&entry.body, url).await.is_ok()
            };
            if !delivered {
                return;
            }

            let entry = self
                .queue
                .pop_front()
                .expect("retry queue cannot be empty here");
            self.current_bytes -= entry_size(&entry.body);
            if let Some(signal) = entry.signal {
                signal(Ok(()));
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn byte_size(&self) -> usize {
        self.current_bytes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::super::testutil::RecordingSender;
    use super::*;

    fn body(tag: &str, len: usize) -> Vec<u8> {
        let mut body = tag.as_bytes().to_vec();
        body.resize(len, b'.');
        body
    }

    #[tokio::test]
    async fn failed_sends_queue_up_and_drain_in_order() {
        let sender = RecordingSender::default();
        let mut queue = RetryQueue::new();

        sender.set_fail(true);
        queue.deliver(&sender, "url", body("first", 16), None).await;
        queue.deliver(&sender, "url", body("second", 16), None).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.byte_size(), 2 * (24 + 16));

        sender.set_fail(false);
        queue.deliver(&sender, "url", body("third", 16), None).await;

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.byte_size(), 0);
        let posts = sender.posts.lock().unwrap();
        let tags: Vec<_> = posts
            .iter()
            .map(|p| String::from_utf8_lossy(&p[..5]).to_string())
            .collect();
        // the fresh payload goes out first, then the backlog in FIFO order
        assert_eq!(tags, vec!["third", "first", "secon"]);
    }

    #[tokio::test]
    async fn drain_stops_at_first_failure() {
        let sender = RecordingSender::default();
        let mut queue = RetryQueue::new();

        sender.set_fail(true);
        queue.deliver(&sender, "url", body("first", 16), None).await;

        // this send succeeds but the drain fails immediately after
        struct FlipSender {
            inner: RecordingSender,
            sent: AtomicUsize,
        }
        impl HttpSender for FlipSender {
            fn post<'a>(
                &'a self,
                body: &'a [u8],
                url: &'a str,
            ) -> futures::future::BoxFuture<'a, crate::Result<()>> {
                Box::pin(async move {
                    if self.sent.fetch_add(1, Ordering::SeqCst) >= 1 {
                        self.inner.set_fail(true);
                    }
                    self.inner.post(body, url).await
                })
            }
        }

        let flip = FlipSender {
            inner: RecordingSender::default(),
            sent: AtomicUsize::new(0),
        };
        queue.deliver(&flip, "url", body("fresh", 16), None).await;

        assert_eq!(flip.inner.post_count(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn oldest_entries_are_evicted_when_full() {
        let sender = RecordingSender::default();
        // room for two 16-byte payloads plus overhead, not three
        let mut queue = RetryQueue::with_max_bytes(3 * (24 + 16) - 1);
        let evicted = Arc::new(Mutex::new(Vec::new()));

        sender.set_fail(true);
        for tag in ["first", "secon", "third"] {
            let evicted = Arc::clone(&evicted);
            let signal_tag = tag.to_owned();
            let signal: DeliverySignal = Box::new(move |outcome| {
                if matches!(outcome, Err(Error::QueueOverflow)) {
                    evicted.lock().unwrap().push(signal_tag);
                }
            });
            queue.deliver(&sender, "url", body(tag, 16), Some(signal)).await;
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(*evicted.lock().unwrap(), vec!["first".to_owned()]);
    }

    #[tokio::test]
    async fn oversized_payload_is_dropped() {
        let sender = RecordingSender::default();
        let mut queue = RetryQueue::with_max_bytes(64);
        let evicted = Arc::new(Mutex::new(false));

        sender.set_fail(true);
        let signal: DeliverySignal = {
            let evicted = Arc::clone(&evicted);
            Box::new(move |outcome| {
                *evicted.lock().unwrap() = matches!(outcome, Err(Error::QueueOverflow));
            })
        };
        queue.deliver(&sender, "url", body("huge!", 128), Some(signal)).await;

        assert_eq!(queue.len(), 0);
        assert!(*evicted.lock().unwrap());
    }

    #[tokio::test]
    async fn delivered_signal_fires_on_success() {
        let sender = RecordingSender::default();
        let mut queue = RetryQueue::new();
        let delivered = Arc::new(Mutex::new(false));

        let signal: DeliverySignal = {
            let delivered = Arc::clone(&delivered);
            Box::new(move |outcome| {
                *delivered.lock().unwrap() = outcome.is_ok();
            })
        };
        queue.deliver(&sender, "url", body("only!", 16), Some(signal)).await;

        assert!(*delivered.lock().unwrap());
        assert_eq!(queue.len(), 0);
    }
}
