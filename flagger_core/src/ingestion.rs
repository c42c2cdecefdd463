//! The ingestion pipeline: batches entities, exposures and events, ships
//! them to the ingestion endpoint, and retries failed payloads from a
//! byte-bounded FIFO.
//!
//! The pipeline owns its state exclusively; the rest of the SDK talks to it
//! by message passing. Flushes are triggered by size, by time, by detected
//! flags, and by the first exposures of the SDK lifetime (see
//! [`pipeline::Ingester`]).

mod http;
mod pipeline;
mod retry_queue;

pub use http::{HttpSender, ReqwestSender};
pub use pipeline::{Ingester, FIRST_EXPOSURES_FLUSH_COUNT};
