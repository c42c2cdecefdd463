use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing key-value pairs of entity
/// attributes.
///
/// Keys are strings representing attribute names. Filters match against
/// attributes by their lowercased name, so attribute maps should be passed
/// through [`escape_attributes`] (or [`crate::Entity::escape`]) before
/// evaluation.
///
/// # Examples
/// ```
/// # use flagger_core::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("country".to_owned(), "FR".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of an entity attribute.
///
/// Only strings, numbers and booleans are admitted; dates are carried as
/// RFC3339 strings and parsed at filter-match time. Conveniently implements
/// `From` conversions for `String`, `&str`, `f64`, integer types, and
/// `bool`. Integers widen to `f64` so that attributes compare consistently
/// with JSON-decoded filter values.
///
/// Examples:
/// ```
/// # use flagger_core::AttributeValue;
/// let string_attr: AttributeValue = "example".into();
/// let number_attr: AttributeValue = 42.into();
/// let bool_attr: AttributeValue = true.into();
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A boolean value.
    Boolean(bool),
    /// A numerical value.
    Number(f64),
    /// A string value.
    String(String),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> AttributeValue {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> AttributeValue {
        AttributeValue::String(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> AttributeValue {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> AttributeValue {
        AttributeValue::Number(value as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> AttributeValue {
        AttributeValue::Number(value as f64)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> AttributeValue {
        AttributeValue::Boolean(value)
    }
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_ref())
        } else {
            None
        }
    }
}

/// Lowercase every attribute key. Values are already constrained to the
/// admitted scalar kinds by [`AttributeValue`]. Idempotent.
pub fn escape_attributes(attributes: &Attributes) -> Attributes {
    attributes
        .iter()
        .map(|(key, value)| (key.to_lowercase(), value.clone()))
        .collect()
}
