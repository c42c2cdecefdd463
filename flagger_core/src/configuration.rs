use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::filters::FlagFilter;

/// Flagger configuration: the environment hash key, the flag set, and the
/// server-controlled SDK tuning knobs.
///
/// A `Configuration` is immutable once stored and can only be replaced
/// fully (see [`crate::configuration_store::ConfigurationStore`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "hashKey", default)]
    pub hash_key: String,
    #[serde(default)]
    pub flags: Vec<TryParse<FlagConfig>>,
    #[serde(rename = "sdkConfig", default)]
    pub sdk_config: SdkConfig,
}

impl Configuration {
    /// Normalize every flag in place. Idempotent; called once when the
    /// configuration enters the store.
    pub(crate) fn escape(&mut self) {
        for flag in &mut self.flags {
            if let TryParse::Parsed(flag) = flag {
                flag.escape();
            }
        }
    }

    pub(crate) fn find_flag(&self, codename: &str) -> Option<&FlagConfig> {
        self.flags
            .iter()
            .filter_map(Option::<&FlagConfig>::from)
            .find(|flag| flag.codename == codename)
    }
}

/// Server-controlled ingestion knobs, delivered inside the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(rename = "SDK_INGESTION_INTERVAL")]
    pub ingestion_interval_seconds: u64,
    #[serde(rename = "SDK_INGESTION_MAX_CALLS")]
    pub ingestion_max_items: usize,
}

impl SdkConfig {
    /// Ingestion interval, clamped to at least one second so a zero value
    /// cannot spin the flush timer.
    pub fn ingestion_interval(&self) -> Duration {
        Duration::from_secs(self.ingestion_interval_seconds.max(1))
    }

    /// Max accumulated publishes before a flush, clamped to at least one.
    pub fn ingestion_max_items(&self) -> usize {
        self.ingestion_max_items.max(1)
    }
}

impl Default for SdkConfig {
    fn default() -> SdkConfig {
        SdkConfig {
            ingestion_interval_seconds: 60,
            ingestion_max_items: 500,
        }
    }
}

/// Configuration of a single flag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlagConfig {
    pub codename: String,
    #[serde(rename = "killSwitchEngaged", default)]
    pub kill_switch_engaged: bool,
    #[serde(rename = "hashkey", default, skip_serializing_if = "String::is_empty")]
    pub hash_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variations: Vec<FlagVariation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subpopulations: Vec<FlagSubpopulation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blacklist: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub whitelist: Vec<Entity>,
}

impl FlagConfig {
    fn escape(&mut self) {
        for subpopulation in &mut self.subpopulations {
            subpopulation.escape();
        }
    }
}

/// Payload attached to a variation; an arbitrary JSON object.
pub type Payload = HashMap<String, serde_json::Value>;

/// One of a flag's enumerated outcomes: a codename, a probability weight in
/// `[0, 1]`, and an arbitrary payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlagVariation {
    pub codename: String,
    pub probability: f64,
    #[serde(default)]
    pub payload: Payload,
}

impl FlagVariation {
    /// The default "off" sentinel returned when no variation applies.
    pub fn off() -> FlagVariation {
        FlagVariation {
            codename: "off".to_owned(),
            probability: 1.0,
            payload: Payload::new(),
        }
    }
}

/// A filtered sampling target scoped to one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagSubpopulation {
    #[serde(rename = "entityType")]
    pub entity_type: String,
    #[serde(rename = "samplingPercentage")]
    pub sampling_percentage: f64,
    #[serde(default)]
    pub filters: Vec<TryParse<FlagFilter>>,
}

impl FlagSubpopulation {
    fn escape(&mut self) {
        // Filters that failed to parse (e.g. an operator this SDK does not
        // know) are dropped here rather than failing the whole flag.
        self.filters.retain(|filter| matches!(filter, TryParse::Parsed(_)));
        for filter in &mut self.filters {
            if let TryParse::Parsed(filter) = filter {
                filter.escape();
            }
        }
    }
}

/// `TryParse` allows a subfield to fail parsing without failing the parsing
/// of the whole structure.
///
/// This isolates errors in a subtree: if one flag (or one filter) arrives in
/// a format this SDK does not understand, the rest of the configuration is
/// still usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<T> for TryParse<T> {
    fn from(value: T) -> TryParse<T> {
        TryParse::Parsed(value)
    }
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Option<T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
