//! `flagger_core` is the engine behind the Flagger SDK: deterministic flag
//! evaluation, the configuration lifecycle (initial fetch + server-sent
//! updates), and the ingestion pipeline that reports exposures and events
//! back to the server.
//!
//! # Overview
//!
//! The crate is organized as a set of building blocks. Most applications
//! should use the `flagger` crate, which wires these blocks together behind
//! a small synchronous API; `flagger_core` is exposed separately so that
//! tests and embedders can construct isolated instances.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod configuration_fetcher;
pub mod configuration_store;
pub mod eval;
pub mod filters;
pub mod hash;
pub mod ingestion;
pub mod sse;

mod attributes;
mod configuration;
mod entity;
mod error;
mod events;

pub use attributes::{escape_attributes, AttributeValue, Attributes};
pub use configuration::{
    Configuration, FlagConfig, FlagSubpopulation, FlagVariation, Payload, SdkConfig, TryParse,
};
pub use entity::{Entity, Group};
pub use error::{Error, Result};
pub use events::{Event, Exposure, IngestionBatch, SdkInfo};
