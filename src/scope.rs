//! Scope values and the bundle key they format to.
//!
//! A rule declares an ordered list of scope dimensions; a request supplies values for them.
//! The key joins the values in declared order with `|`. Backslash escapes `\` and `|` inside a
//! value, so the mapping from values to key is injective and can be reversed with
//! [`parse_scope_key`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SEPARATOR: char = '|';
const ESCAPE: char = '\\';

/// Named dimension values of one request, e.g. `{"userId": "42"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(BTreeMap<String, String>);

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Scope {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Scope {
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

/// Format the bundle key for `scope` over the declared `dimensions`.
pub fn format_scope(dimensions: &[String], scope: &Scope) -> Result<String, ConfigError> {
    let mut key = String::new();
    for (index, name) in dimensions.iter().enumerate() {
        let value = scope.get(name).ok_or_else(|| ConfigError::MissingScope { name: name.clone() })?;
        if index > 0 {
            key.push(SEPARATOR);
        }
        for c in value.chars() {
            if c == SEPARATOR || c == ESCAPE {
                key.push(ESCAPE);
            }
            key.push(c);
        }
    }
    Ok(key)
}

/// Split a key produced by [`format_scope`] back into its values.
pub fn parse_scope_key(key: &str) -> Vec<String> {
    let mut values = vec![String::new()];
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => {
                if let (Some(next), Some(current)) = (chars.next(), values.last_mut()) {
                    current.push(next);
                }
            }
            SEPARATOR => values.push(String::new()),
            _ => {
                if let Some(current) = values.last_mut() {
                    current.push(c);
                }
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn declared_order_decides_key() {
        let a = Scope::new().with("userId", "1").with("propertyId", "2");
        let b = Scope::new().with("propertyId", "2").with("userId", "1");
        let dimensions = dims(&["userId", "propertyId"]);
        assert_eq!(format_scope(&dimensions, &a).unwrap(), "1|2");
        assert_eq!(format_scope(&dimensions, &a), format_scope(&dimensions, &b));
    }

    #[test]
    fn extra_dimensions_are_ignored() {
        let scope = Scope::from([("userId", "1"), ("other", "x")]);
        assert_eq!(format_scope(&dims(&["userId"]), &scope).unwrap(), "1");
        assert_eq!(format_scope(&[], &scope).unwrap(), "");
    }

    #[test]
    fn missing_dimension_is_an_error() {
        let err = format_scope(&dims(&["userId"]), &Scope::new()).unwrap_err();
        assert_eq!(err, ConfigError::MissingScope { name: "userId".into() });
        assert_eq!(err.to_string(), "Please pass a value for the \"userId\" scope with your quota request");
    }

    #[test]
    fn separators_inside_values_do_not_collide() {
        let dimensions = dims(&["a", "b"]);
        let left = Scope::from([("a", "x|"), ("b", "y")]);
        let right = Scope::from([("a", "x"), ("b", "|y")]);
        let left_key = format_scope(&dimensions, &left).unwrap();
        let right_key = format_scope(&dimensions, &right).unwrap();
        assert_ne!(left_key, right_key);
        assert_eq!(parse_scope_key(&left_key), vec!["x|", "y"]);
        assert_eq!(parse_scope_key(&right_key), vec!["x", "|y"]);
    }

    #[test]
    fn escapes_round_trip() {
        let dimensions = dims(&["a", "b", "c"]);
        let scope = Scope::from([("a", "\\|"), ("b", ""), ("c", "||\\")]);
        let key = format_scope(&dimensions, &scope).unwrap();
        assert_eq!(parse_scope_key(&key), vec!["\\|", "", "||\\"]);
    }
}
