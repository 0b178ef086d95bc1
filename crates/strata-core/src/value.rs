//! Property values and the flat key-value record format

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Ordered property map used for entity/relation properties and metadata
pub type Properties = BTreeMap<String, PropertyValue>;

/// Flat key-value record used for persistence and cross-process transfer
pub type Record = BTreeMap<String, PropertyValue>;

/// A property value.
///
/// The set is closed: strings, integers, floats, booleans, ordered lists and
/// nested maps. There is no null. Values serialize untagged, so a record is
/// plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of integers and floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Name of the variant, used in validation messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Ordering between comparable values.
    ///
    /// Numbers compare numerically across integer/float, strings
    /// lexicographically, booleans false < true. Anything else is
    /// incomparable.
    pub fn compare(&self, other: &PropertyValue) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Containment: substring for strings, membership for lists, key for maps
    pub fn contains(&self, needle: &PropertyValue) -> bool {
        match (self, needle) {
            (Self::String(haystack), Self::String(n)) => haystack.contains(n.as_str()),
            (Self::List(items), _) => items.iter().any(|item| item == needle),
            (Self::Map(map), Self::String(key)) => map.contains_key(key),
            _ => false,
        }
    }

    /// True when every float inside the value is finite
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            Self::List(items) => items.iter().all(PropertyValue::is_finite),
            Self::Map(map) => map.values().all(PropertyValue::is_finite),
            _ => true,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&String> for PropertyValue {
    fn from(s: &String) -> Self {
        Self::String(s.clone())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for PropertyValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<u32> for PropertyValue {
    fn from(i: u32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<f32> for PropertyValue {
    fn from(f: f32) -> Self {
        Self::Float(f64::from(f))
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, PropertyValue>> for PropertyValue {
    fn from(map: BTreeMap<String, PropertyValue>) -> Self {
        Self::Map(map)
    }
}

/// Types that round-trip through a flat [`Record`]
pub trait FlatRecord: Sized {
    fn to_record(&self) -> Record;

    fn from_record(record: Record) -> crate::Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_json_shape() {
        let mut props = Properties::new();
        props.insert("name".into(), "Alice".into());
        props.insert("age".into(), 34.into());
        props.insert("score".into(), 0.75.into());
        props.insert("active".into(), true.into());
        props.insert("tags".into(), vec!["a", "b"].into());

        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(
            json,
            r#"{"active":true,"age":34,"name":"Alice","score":0.75,"tags":["a","b"]}"#
        );

        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_integer_and_float_stay_distinct() {
        let int: PropertyValue = serde_json::from_str("3").unwrap();
        let float: PropertyValue = serde_json::from_str("3.0").unwrap();
        assert_eq!(int, PropertyValue::Integer(3));
        assert_eq!(float, PropertyValue::Float(3.0));
    }

    #[test]
    fn test_exponent_float_keeps_its_kind() {
        let big = PropertyValue::Float(1e18);
        let json = serde_json::to_string(&big).unwrap();
        assert_eq!(json, "1e18");
        let back: PropertyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, big);

        // The same magnitude written without an exponent is an integer
        let normalised: PropertyValue = serde_json::from_str("1000000000000000000").unwrap();
        assert_eq!(normalised, PropertyValue::Integer(1_000_000_000_000_000_000));
    }

    #[test]
    fn test_null_is_rejected() {
        assert!(serde_json::from_str::<PropertyValue>("null").is_err());
    }

    #[test]
    fn test_compare_mixed_numbers() {
        let a = PropertyValue::Integer(2);
        let b = PropertyValue::Float(2.5);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(a.compare(&"2".into()), None);
    }

    #[test]
    fn test_contains() {
        let s: PropertyValue = "graph storage".into();
        assert!(s.contains(&"storage".into()));

        let list: PropertyValue = vec![1i64, 2, 3].into();
        assert!(list.contains(&2i64.into()));
        assert!(!list.contains(&5i64.into()));
    }

    #[test]
    fn test_is_finite_nested() {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), PropertyValue::Float(f64::NAN));
        assert!(!PropertyValue::Map(inner).is_finite());
        assert!(PropertyValue::Float(1.5).is_finite());
    }
}
