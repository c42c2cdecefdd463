use serde::{Deserialize, Serialize};

use crate::attributes::{escape_attributes, Attributes};

const DEFAULT_ENTITY_TYPE: &str = "User";

/// `Entity` is the subject of a flag decision: a user, a company, a device.
///
/// Identity is the `(id, type)` pair; `type` defaults to `"User"` when
/// absent. An entity may belong to a [`Group`], which is matched by group
/// blacklist/whitelist entries and group subpopulations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Variation override; only meaningful on whitelist entries.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

impl Entity {
    /// Create an entity with the given id and the default `"User"` type.
    pub fn new(id: impl Into<String>) -> Entity {
        Entity {
            id: id.into(),
            ..Entity::default()
        }
    }

    /// Normalize the entity into its canonical in-memory representation:
    /// attribute keys are lowercased, `name` and `id` are mirrored into the
    /// attributes when those keys are absent, and the entity type defaults
    /// to `"User"`. Group attributes are lowercased as well.
    ///
    /// Escaping is idempotent and does not mutate `self`.
    pub fn escape(&self) -> Entity {
        let mut attributes = escape_attributes(&self.attributes);
        if !self.name.is_empty() && !attributes.contains_key("name") {
            attributes.insert("name".to_owned(), self.name.clone().into());
        }
        attributes
            .entry("id".to_owned())
            .or_insert_with(|| self.id.clone().into());

        let entity_type = if self.entity_type.is_empty() {
            DEFAULT_ENTITY_TYPE.to_owned()
        } else {
            self.entity_type.clone()
        };

        Entity {
            id: self.id.clone(),
            entity_type,
            name: self.name.clone(),
            variation: self.variation.clone(),
            group: self.group.as_ref().map(Group::escape),
            attributes,
        }
    }

    /// Individual match: same id and case-insensitive same type.
    pub(crate) fn equals(&self, entity: &Entity) -> bool {
        self.id == entity.id && self.entity_type.eq_ignore_ascii_case(&entity.entity_type)
    }

    /// Group match: this (blacklist/whitelist) entry names the given group.
    pub(crate) fn equals_group(&self, group: &Group) -> bool {
        self.id == group.id && self.entity_type.eq_ignore_ascii_case(&group.entity_type)
    }
}

/// `Group` has the same shape as [`Entity`] minus the whitelist variation.
/// Groups are composition, not recursion: a group has no sub-group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

impl Group {
    fn escape(&self) -> Group {
        Group {
            id: self.id.clone(),
            entity_type: self.entity_type.clone(),
            name: self.name.clone(),
            attributes: escape_attributes(&self.attributes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_defaults_type_and_mirrors_identity() {
        let entity = Entity {
            id: "42".to_owned(),
            name: "Ada".to_owned(),
            attributes: [("Country".to_owned(), "UA".into())].into_iter().collect(),
            ..Entity::default()
        };

        let escaped = entity.escape();

        assert_eq!(escaped.entity_type, "User");
        assert_eq!(escaped.attributes.get("id"), Some(&"42".into()));
        assert_eq!(escaped.attributes.get("name"), Some(&"Ada".into()));
        assert_eq!(escaped.attributes.get("country"), Some(&"UA".into()));
        // the caller's entity is untouched
        assert_eq!(entity.entity_type, "");
    }

    #[test]
    fn escape_keeps_explicit_attributes() {
        let entity = Entity {
            id: "42".to_owned(),
            name: "Ada".to_owned(),
            attributes: [
                ("id".to_owned(), "different".into()),
                ("name".to_owned(), "Grace".into()),
            ]
            .into_iter()
            .collect(),
            ..Entity::default()
        };

        let escaped = entity.escape();

        assert_eq!(escaped.attributes.get("id"), Some(&"different".into()));
        assert_eq!(escaped.attributes.get("name"), Some(&"Grace".into()));
    }

    #[test]
    fn escape_is_idempotent() {
        let entity = Entity {
            id: "42".to_owned(),
            name: "Ada".to_owned(),
            group: Some(Group {
                id: "7".to_owned(),
                entity_type: "Company".to_owned(),
                attributes: [("Size".to_owned(), 10.into())].into_iter().collect(),
                ..Group::default()
            }),
            attributes: [("Country".to_owned(), "UA".into())].into_iter().collect(),
            ..Entity::default()
        };

        let once = entity.escape();
        let twice = once.escape();

        assert_eq!(once, twice);
    }

    #[test]
    fn equals_is_case_insensitive_on_type() {
        let a = Entity {
            id: "1".to_owned(),
            entity_type: "User".to_owned(),
            ..Entity::default()
        };
        let b = Entity {
            id: "1".to_owned(),
            entity_type: "user".to_owned(),
            ..Entity::default()
        };
        let c = Entity {
            id: "1".to_owned(),
            entity_type: "Company".to_owned(),
            ..Entity::default()
        };

        assert!(a.equals(&b));
        assert!(!a.equals(&c));
    }

    #[test]
    fn untyped_matcher_does_not_equal_defaulted_entity() {
        // A blacklist entry without a type does not match an escaped entity,
        // whose type has been defaulted to "User".
        let matcher = Entity::new("1");
        let entity = Entity::new("1").escape();

        assert!(!matcher.equals(&entity));
    }
}
