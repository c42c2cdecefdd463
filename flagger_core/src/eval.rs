//! The decision engine: a pure function from configuration, entity and flag
//! codename to a [`FlagResult`].

use serde::Serialize;

use crate::configuration::{Configuration, FlagConfig, FlagSubpopulation, FlagVariation, Payload};
use crate::entity::Entity;
use crate::filters::match_filters;
use crate::hash::{sampling_hash, variation_hash};
use crate::Attributes;

/// Why a decision came out the way it did. Exactly one reason is attached to
/// every [`FlagResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reason {
    /// Flag codename is empty.
    CodenameIsEmpty,
    /// Flagger is not initialized.
    FlaggerIsNotInitialized,
    /// No flags in the current config.
    ConfigIsEmpty,
    /// No entity was provided and no default entity is set.
    NoEntityProvided,
    /// Entity id is empty.
    IdIsEmpty,
    /// Flag is missing from the current config.
    FlagNotInConfig,
    /// Kill switch engaged.
    KillSwitchEngaged,
    /// Entity is individually blacklisted.
    IndividualBlacklist,
    /// Entity is individually whitelisted.
    IndividualWhitelist,
    /// Entity's group is blacklisted.
    GroupBlacklist,
    /// Entity's group is whitelisted.
    GroupWhitelist,
    /// Entity is sampled in the individual subpopulation.
    IsSampled,
    /// Entity is sampled in the group subpopulation.
    IsSampledByGroup,
    /// Default (off) treatment reached.
    Default,
}

impl Reason {
    /// Decisions made without usable input produce no exposure.
    pub fn should_ingest(&self) -> bool {
        !matches!(
            self,
            Reason::CodenameIsEmpty
                | Reason::NoEntityProvided
                | Reason::FlaggerIsNotInitialized
                | Reason::IdIsEmpty
        )
    }
}

/// The outcome of evaluating one flag for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagResult {
    pub hashkey: String,
    pub entity: Option<Entity>,
    pub enabled: bool,
    pub sampled: bool,
    pub variation: FlagVariation,
    pub payload: Payload,
    /// The queried codename was absent from the configuration; the server
    /// is told about it via `detectedFlags`.
    pub is_new: bool,
    pub reason: Reason,
}

impl FlagResult {
    fn off(entity: Option<&Entity>, reason: Reason, is_new: bool) -> FlagResult {
        FlagResult {
            hashkey: String::new(),
            entity: entity.cloned(),
            enabled: false,
            sampled: false,
            variation: FlagVariation::off(),
            payload: Payload::new(),
            is_new,
            reason,
        }
    }

    fn disabled(flag: &FlagConfig, entity: &Entity, reason: Reason) -> FlagResult {
        FlagResult {
            hashkey: flag.hash_key.clone(),
            entity: Some(entity.clone()),
            enabled: false,
            sampled: false,
            variation: FlagVariation::off(),
            payload: Payload::new(),
            is_new: false,
            reason,
        }
    }

    fn whitelisted(flag: &FlagConfig, entity: &Entity, codename: &str, reason: Reason) -> FlagResult {
        let variation = extract_variation(flag, codename);
        FlagResult {
            hashkey: flag.hash_key.clone(),
            entity: Some(entity.clone()),
            enabled: true,
            sampled: false,
            payload: variation.payload.clone(),
            variation,
            is_new: false,
            reason,
        }
    }

    fn sampled(flag: &FlagConfig, entity: &Entity, hash: f64, reason: Reason) -> FlagResult {
        let variation = choose_variation(hash, &flag.variations);
        FlagResult {
            hashkey: flag.hash_key.clone(),
            entity: Some(entity.clone()),
            enabled: true,
            sampled: true,
            payload: variation.payload.clone(),
            variation,
            is_new: false,
            reason,
        }
    }
}

/// Evaluate `codename` for `entity` against `configuration`.
///
/// Pure: equal inputs always produce equal outputs. Entities are expected to
/// be escaped already (see [`Entity::escape`]); the facade and the
/// configuration store guarantee this.
pub fn evaluate(
    configuration: Option<&Configuration>,
    default_entity: Option<&Entity>,
    codename: &str,
    entity: Option<&Entity>,
) -> FlagResult {
    if codename.is_empty() {
        log::warn!(target: "flagger", "codename is empty, returning \"off\" variation");
        return FlagResult::off(entity, Reason::CodenameIsEmpty, false);
    }

    let Some(configuration) = configuration else {
        log::warn!(target: "flagger", "flagger is not initialized");
        return FlagResult::off(entity, Reason::FlaggerIsNotInitialized, true);
    };

    if configuration.flags.is_empty() {
        return FlagResult::off(entity, Reason::ConfigIsEmpty, true);
    }

    let Some(entity) = entity.or(default_entity) else {
        return FlagResult::off(None, Reason::NoEntityProvided, false);
    };

    if entity.id.is_empty() {
        log::warn!(target: "flagger", codename; "entity id is empty, returning \"off\" variation");
        return FlagResult::off(Some(entity), Reason::IdIsEmpty, false);
    }

    match configuration.find_flag(codename) {
        Some(flag) => evaluate_flag(&configuration.hash_key, flag, entity),
        None => FlagResult::off(Some(entity), Reason::FlagNotInConfig, true),
    }
}

fn evaluate_flag(config_hash_key: &str, flag: &FlagConfig, entity: &Entity) -> FlagResult {
    if flag.kill_switch_engaged {
        return FlagResult::disabled(flag, entity, Reason::KillSwitchEngaged);
    }

    // Individual policy always beats group policy: the individual lists are
    // consulted before any group check.
    if flag.blacklist.iter().any(|e| e.equals(entity)) {
        return FlagResult::disabled(flag, entity, Reason::IndividualBlacklist);
    }

    if let Some(entry) = flag.whitelist.iter().find(|e| e.equals(entity)) {
        return FlagResult::whitelisted(flag, entity, &entry.variation, Reason::IndividualWhitelist);
    }

    if let Some(group) = &entity.group {
        if flag.blacklist.iter().any(|e| e.equals_group(group)) {
            return FlagResult::disabled(flag, entity, Reason::GroupBlacklist);
        }

        if let Some(entry) = flag.whitelist.iter().find(|e| e.equals_group(group)) {
            return FlagResult::whitelisted(flag, entity, &entry.variation, Reason::GroupWhitelist);
        }
    }

    // individual sampling
    let hash = sampling_hash(config_hash_key, &flag.hash_key, &entity.id, &entity.entity_type);
    if sample_subpopulation(hash, &flag.subpopulations, &entity.entity_type, &entity.attributes)
        .is_some()
    {
        let hash = variation_hash(&flag.codename, &entity.id, &entity.entity_type);
        return FlagResult::sampled(flag, entity, hash, Reason::IsSampled);
    }

    // group sampling
    if let Some(group) = &entity.group {
        let hash = sampling_hash(config_hash_key, &flag.hash_key, &group.id, &group.entity_type);
        if sample_subpopulation(hash, &flag.subpopulations, &group.entity_type, &group.attributes)
            .is_some()
        {
            let hash = variation_hash(&flag.codename, &group.id, &group.entity_type);
            return FlagResult::sampled(flag, entity, hash, Reason::IsSampledByGroup);
        }
    }

    FlagResult::disabled(flag, entity, Reason::Default)
}

/// The whitelist names a variation by codename; an unknown codename falls
/// back to the "off" sentinel.
fn extract_variation(flag: &FlagConfig, codename: &str) -> FlagVariation {
    flag.variations
        .iter()
        .find(|v| v.codename == codename)
        .cloned()
        .unwrap_or_else(FlagVariation::off)
}

/// Walk the variations in declared order accumulating probabilities and
/// return the first whose running sum reaches the hash. A hash falling into
/// the tail (when the probabilities sum below one) gets the "off" sentinel.
fn choose_variation(hash: f64, variations: &[FlagVariation]) -> FlagVariation {
    let mut cumulative = 0.0;
    for variation in variations {
        cumulative += variation.probability;
        if hash <= cumulative {
            return variation.clone();
        }
    }
    FlagVariation::off()
}

fn sample_subpopulation<'a>(
    hash: f64,
    subpopulations: &'a [FlagSubpopulation],
    entity_type: &str,
    attributes: &Attributes,
) -> Option<&'a FlagSubpopulation> {
    subpopulations.iter().find(|sp| {
        sp.entity_type == entity_type
            && hash < sp.sampling_percentage
            && match_filters(&sp.filters, attributes)
    })
}
