//! Flagger is a feature-flag SDK that decides locally — from a cached
//! configuration kept live over a server-push stream — whether a flag is
//! enabled for an entity, which variation the entity receives, and what
//! payload comes with it. Every decision and every tracked event is
//! summarized and reported back to the ingestion endpoint in the
//! background.
//!
//! # Usage
//!
//! Most applications use the process-wide instance behind the module-level
//! functions:
//!
//! ```no_run
//! use flagger::{Entity, InitArgs};
//!
//! fn main() -> flagger::Result<()> {
//!     flagger::init(&InitArgs::from_api_key("api-key"))?;
//!
//!     let user = Entity::new("42");
//!     if flagger::is_enabled("new-checkout", Some(&user)) {
//!         // new code path
//!     }
//!
//!     flagger::shutdown(std::time::Duration::from_secs(1));
//!     Ok(())
//! }
//! ```
//!
//! Isolated instances (for tests or multi-tenant hosts) are created with
//! [`Flagger::new`].
//!
//! # Configuration
//!
//! [`InitArgs`] fields left empty fall back to the `FLAGGER_API_KEY`,
//! `FLAGGER_SOURCE_URL`, `FLAGGER_BACKUP_SOURCE_URL`, `FLAGGER_SSE_URL`,
//! `FLAGGER_INGESTION_URL` and `FLAGGER_LOG_LEVEL` environment variables,
//! then to the production defaults.

use std::sync::LazyLock;
use std::time::Duration;

mod client;
mod config;

pub use client::Flagger;
pub use config::InitArgs;

// Re-export the core vocabulary so applications depend on one crate.
pub use flagger_core::eval::{FlagResult, Reason};
pub use flagger_core::{
    AttributeValue, Attributes, Entity, Error, Event, FlagVariation, Group, Payload, Result,
};

static STD_FLAGGER: LazyLock<Flagger> = LazyLock::new(Flagger::new);

/// Initialize the process-wide Flagger instance. See [`Flagger::init`].
pub fn init(args: &InitArgs) -> Result<()> {
    STD_FLAGGER.init(args)
}

/// Shut down the process-wide instance; returns `true` iff the ingestion
/// drain timed out. See [`Flagger::shutdown`].
pub fn shutdown(timeout: Duration) -> bool {
    STD_FLAGGER.shutdown(timeout)
}

/// Explicitly report an entity. See [`Flagger::publish`].
pub fn publish(entity: &Entity) {
    STD_FLAGGER.publish(entity)
}

/// Track a user event. See [`Flagger::track`].
pub fn track(event: &Event) {
    STD_FLAGGER.track(event)
}

/// Store the default entity used when flag functions are called without
/// one. See [`Flagger::set_entity`].
pub fn set_entity(entity: Option<&Entity>) {
    STD_FLAGGER.set_entity(entity)
}

/// Determines if the flag is enabled for the entity.
pub fn is_enabled(codename: &str, entity: Option<&Entity>) -> bool {
    STD_FLAGGER.is_enabled(codename, entity)
}

/// Determines if the entity is within one of the flag's targeted
/// subpopulations.
pub fn is_sampled(codename: &str, entity: Option<&Entity>) -> bool {
    STD_FLAGGER.is_sampled(codename, entity)
}

/// Returns the variation assigned to the entity in a multivariate flag.
pub fn get_variation(codename: &str, entity: Option<&Entity>) -> String {
    STD_FLAGGER.get_variation(codename, entity)
}

/// Returns the payload associated with the variation assigned to the
/// entity.
pub fn get_payload(codename: &str, entity: Option<&Entity>) -> Payload {
    STD_FLAGGER.get_payload(codename, entity)
}
