//! Typed attribute filters used by flag subpopulations.
//!
//! A filter matches one entity attribute against a value of a declared type
//! (`STRING`, `NUMBER`, `BOOLEAN`, `DATE`) under one of the closed set of
//! operators. Filters arrive as JSON and are normalized once by
//! [`FlagFilter::escape`]: attribute names are lowercased, `DATE` values are
//! parsed into instants, and heterogeneous JSON arrays are coerced into the
//! declared-type list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attributes::{AttributeValue, Attributes};
use crate::configuration::TryParse;

/// Filter operator. The set is closed; filters with an unrecognized
/// operator fail to parse and are dropped when the configuration is
/// escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Is,
    IsNot,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
}

/// Declared type of a filter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    String,
    Number,
    Boolean,
    Date,
}

/// A filter value as decoded from JSON, before and after escaping.
///
/// The `Date` and `DateList` variants are produced by [`FlagFilter::escape`]
/// from RFC3339 strings when the declared type is `DATE`; untagged
/// deserialization never yields them directly. `List` holds an arbitrary
/// JSON array that has not been coerced to the declared type yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    BooleanList(Vec<bool>),
    NumberList(Vec<f64>),
    StringList(Vec<String>),
    DateList(Vec<DateTime<Utc>>),
    List(Vec<serde_json::Value>),
}

/// One attribute filter of a subpopulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagFilter {
    #[serde(rename = "attributeName")]
    pub attribute_name: String,
    pub operator: Operator,
    pub value: FilterValue,
    #[serde(rename = "type")]
    pub filter_type: FilterType,
}

impl FlagFilter {
    /// Normalize the filter in place. Idempotent.
    pub(crate) fn escape(&mut self) {
        self.attribute_name = self.attribute_name.to_lowercase();

        if self.filter_type == FilterType::Date {
            match &self.value {
                FilterValue::String(s) => match parse_rfc3339(s) {
                    Some(ts) => self.value = FilterValue::Date(ts),
                    None => {
                        log::warn!(target: "flagger", "cannot parse date filter value: {s:?}");
                        return;
                    }
                },
                FilterValue::StringList(ss) => {
                    let parsed: Vec<_> = ss.iter().filter_map(|s| parse_rfc3339(s)).collect();
                    self.value = FilterValue::DateList(parsed);
                }
                _ => {}
            }
        }

        // JSON arrays decode as a heterogeneous list; keep only the elements
        // that conform to the declared type.
        if self.operator == Operator::In || self.operator == Operator::NotIn {
            if let FilterValue::List(values) = &self.value {
                self.value = match self.filter_type {
                    FilterType::String => FilterValue::StringList(
                        values
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_owned))
                            .collect(),
                    ),
                    FilterType::Number => FilterValue::NumberList(
                        values.iter().filter_map(|v| v.as_f64()).collect(),
                    ),
                    FilterType::Boolean => FilterValue::BooleanList(
                        values.iter().filter_map(|v| v.as_bool()).collect(),
                    ),
                    FilterType::Date => FilterValue::DateList(
                        values
                            .iter()
                            .filter_map(|v| v.as_str().and_then(parse_rfc3339))
                            .collect(),
                    ),
                };
            }
        }
    }

    fn matches(&self, attribute: Option<&AttributeValue>) -> bool {
        let Some(attribute) = attribute else {
            // An absent attribute is a vacuous match for the negative
            // operators and a failure for everything else.
            return self.operator == Operator::IsNot || self.operator == Operator::NotIn;
        };

        match (&self.value, attribute) {
            (FilterValue::String(fv), AttributeValue::String(av)) => {
                assert_string(self.operator, fv == av)
            }
            (FilterValue::Boolean(fv), AttributeValue::Boolean(av)) => {
                assert_bool(self.operator, fv == av)
            }
            (FilterValue::Number(fv), AttributeValue::Number(av)) => {
                assert_ord(self.operator, *fv, *av)
            }
            (FilterValue::Date(fv), AttributeValue::String(av)) => match parse_rfc3339(av) {
                Some(av) => assert_ord(self.operator, *fv, av),
                None => {
                    log::warn!(target: "flagger", "cannot parse date attribute: {av:?}");
                    false
                }
            },
            (FilterValue::StringList(fv), AttributeValue::String(av)) => {
                assert_membership(self.operator, fv.iter().any(|v| v == av))
            }
            (FilterValue::NumberList(fv), AttributeValue::Number(av)) => {
                assert_membership(self.operator, fv.contains(av))
            }
            (FilterValue::BooleanList(fv), AttributeValue::Boolean(av)) => {
                assert_membership(self.operator, fv.contains(av))
            }
            (FilterValue::DateList(fv), AttributeValue::String(av)) => match parse_rfc3339(av) {
                Some(av) => assert_membership(self.operator, fv.contains(&av)),
                None => {
                    log::warn!(target: "flagger", "cannot parse date attribute: {av:?}");
                    false
                }
            },
            // Type mismatch, or a value escape left untouched.
            _ => false,
        }
    }
}

/// Returns `true` iff every filter matches the attributes. Attribute keys
/// are expected to be lowercased already (see [`crate::Entity::escape`]).
pub(crate) fn match_filters(filters: &[TryParse<FlagFilter>], attributes: &Attributes) -> bool {
    filters
        .iter()
        .filter_map(Option::<&FlagFilter>::from)
        .all(|filter| filter.matches(attributes.get(&filter.attribute_name)))
}

/// For scalar strings, `IN` degenerates to `IS` and `NOT_IN` to `IS_NOT`;
/// ordering operators do not apply.
fn assert_string(op: Operator, eq: bool) -> bool {
    match op {
        Operator::Is | Operator::In => eq,
        Operator::IsNot | Operator::NotIn => !eq,
        _ => false,
    }
}

/// Booleans only support equality.
fn assert_bool(op: Operator, eq: bool) -> bool {
    match op {
        Operator::Is => eq,
        Operator::IsNot => !eq,
        _ => false,
    }
}

fn assert_ord<T: PartialOrd>(op: Operator, filter_value: T, attribute_value: T) -> bool {
    match op {
        Operator::Is => attribute_value == filter_value,
        Operator::IsNot => attribute_value != filter_value,
        Operator::Lt => attribute_value < filter_value,
        Operator::Lte => attribute_value <= filter_value,
        Operator::Gt => attribute_value > filter_value,
        Operator::Gte => attribute_value >= filter_value,
        _ => false,
    }
}

fn assert_membership(op: Operator, contained: bool) -> bool {
    match op {
        Operator::In => contained,
        Operator::NotIn => !contained,
        _ => false,
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(
        name: &str,
        operator: Operator,
        value: FilterValue,
        filter_type: FilterType,
    ) -> TryParse<FlagFilter> {
        let mut f = FlagFilter {
            attribute_name: name.to_owned(),
            operator,
            value,
            filter_type,
        };
        f.escape();
        TryParse::Parsed(f)
    }

    fn attrs(pairs: &[(&str, AttributeValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn no_filters_match_everything() {
        assert!(match_filters(&[], &Attributes::new()));
    }

    #[test]
    fn string_is() {
        let filters = [filter(
            "country",
            Operator::Is,
            FilterValue::String("FR".to_owned()),
            FilterType::String,
        )];

        assert!(match_filters(&filters, &attrs(&[("country", "FR".into())])));
        assert!(!match_filters(&filters, &attrs(&[("country", "UA".into())])));
    }

    #[test]
    fn absent_attribute_is_vacuous_for_negative_operators() {
        let empty = Attributes::new();

        let is_not = [filter(
            "country",
            Operator::IsNot,
            FilterValue::String("FR".to_owned()),
            FilterType::String,
        )];
        let not_in = [filter(
            "country",
            Operator::NotIn,
            FilterValue::StringList(vec!["FR".to_owned()]),
            FilterType::String,
        )];
        let is = [filter(
            "country",
            Operator::Is,
            FilterValue::String("FR".to_owned()),
            FilterType::String,
        )];

        assert!(match_filters(&is_not, &empty));
        assert!(match_filters(&not_in, &empty));
        assert!(!match_filters(&is, &empty));
    }

    #[test]
    fn number_ordering() {
        let attributes = attrs(&[("age", 21.into())]);

        for (op, expected) in [
            (Operator::Lt, true),
            (Operator::Lte, true),
            (Operator::Gt, false),
            (Operator::Gte, false),
            (Operator::Is, false),
            (Operator::IsNot, true),
        ] {
            let filters = [filter(
                "age",
                op,
                FilterValue::Number(30.0),
                FilterType::Number,
            )];
            assert_eq!(
                match_filters(&filters, &attributes),
                expected,
                "age=21 {op:?} 30"
            );
        }
    }

    #[test]
    fn type_mismatch_fails() {
        let filters = [filter(
            "age",
            Operator::Is,
            FilterValue::Number(21.0),
            FilterType::Number,
        )];

        assert!(!match_filters(&filters, &attrs(&[("age", "21".into())])));
    }

    #[test]
    fn membership_in_and_not_in() {
        let filters = [filter(
            "country",
            Operator::In,
            FilterValue::StringList(vec!["FR".to_owned(), "UA".to_owned()]),
            FilterType::String,
        )];

        assert!(match_filters(&filters, &attrs(&[("country", "UA".into())])));
        assert!(!match_filters(&filters, &attrs(&[("country", "US".into())])));

        let filters = [filter(
            "country",
            Operator::NotIn,
            FilterValue::StringList(vec!["FR".to_owned(), "UA".to_owned()]),
            FilterType::String,
        )];

        assert!(!match_filters(&filters, &attrs(&[("country", "UA".into())])));
        assert!(match_filters(&filters, &attrs(&[("country", "US".into())])));
    }

    #[test]
    fn date_values_compare_as_instants() {
        let filters = [filter(
            "createdat",
            Operator::Lt,
            FilterValue::String("2021-02-02T00:00:00Z".to_owned()),
            FilterType::Date,
        )];

        assert!(match_filters(
            &filters,
            &attrs(&[("createdat", "2021-01-01T12:00:00+02:00".into())])
        ));
        assert!(!match_filters(
            &filters,
            &attrs(&[("createdat", "2021-03-01T00:00:00Z".into())])
        ));
        // unparseable attribute fails the filter
        assert!(!match_filters(
            &filters,
            &attrs(&[("createdat", "yesterday".into())])
        ));
    }

    #[test]
    fn escape_lowercases_attribute_name() {
        let mut f = FlagFilter {
            attribute_name: "Country".to_owned(),
            operator: Operator::Is,
            value: FilterValue::String("FR".to_owned()),
            filter_type: FilterType::String,
        };
        f.escape();
        assert_eq!(f.attribute_name, "country");
    }

    #[test]
    fn escape_parses_date_values() {
        let mut f = FlagFilter {
            attribute_name: "createdat".to_owned(),
            operator: Operator::Is,
            value: FilterValue::String("2016-03-16T05:44:23Z".to_owned()),
            filter_type: FilterType::Date,
        };
        f.escape();
        assert!(matches!(f.value, FilterValue::Date(_)));

        // a second escape leaves the parsed value untouched
        let before = f.clone();
        f.escape();
        assert_eq!(f, before);
    }

    #[test]
    fn escape_coerces_heterogeneous_lists() {
        let mut f = FlagFilter {
            attribute_name: "country".to_owned(),
            operator: Operator::In,
            value: FilterValue::List(vec![
                serde_json::json!("FR"),
                serde_json::json!(5),
                serde_json::json!("UA"),
            ]),
            filter_type: FilterType::String,
        };
        f.escape();
        assert_eq!(
            f.value,
            FilterValue::StringList(vec!["FR".to_owned(), "UA".to_owned()])
        );
    }

    #[test]
    fn unknown_operator_fails_to_parse() {
        let parsed: TryParse<FlagFilter> = serde_json::from_str(
            r#"{"attributeName": "country", "operator": "EXISTS", "value": "FR", "type": "STRING"}"#,
        )
        .unwrap();
        assert!(matches!(parsed, TryParse::ParseFailed(_)));
    }

    #[test]
    fn wire_arrays_decode_as_typed_lists() {
        let f: FlagFilter = serde_json::from_str(
            r#"{"attributeName": "country", "operator": "IN", "value": ["FR", "UA"], "type": "STRING"}"#,
        )
        .unwrap();
        assert_eq!(
            f.value,
            FilterValue::StringList(vec!["FR".to_owned(), "UA".to_owned()])
        );
    }
}
