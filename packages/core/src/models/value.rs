//! Wire and Typed Values
//!
//! Two value families meet at the parser boundary:
//!
//! - [`RawValue`] is the dynamically shaped value a remote request hands back.
//!   The collaborator may already supply native dates and UUIDs, or only text.
//! - [`AttributeValue`] / [`RelationshipValue`] are the typed values stored in
//!   cache nodes after coercion against the entity model.
//!
//! Nothing outside the parser inspects a `RawValue` field by field.

use super::identifier::{Identifier, ReferenceKey};
use super::schema::AttributeKind;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One record as returned by a remote request
pub type RawRecord = BTreeMap<String, RawValue>;

/// Dynamically shaped wire value
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Explicit null marker
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Native date supplied by the collaborator
    Date(DateTime<Utc>),
    /// Native UUID supplied by the collaborator
    Uuid(Uuid),
    List(Vec<RawValue>),
    /// Nested object payload
    Record(RawRecord),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RawRecord> {
        match self {
            RawValue::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<RawRecord> {
        match self {
            RawValue::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Render back to JSON (dates as RFC 3339, UUIDs as text)
    pub fn to_json(&self) -> Value {
        match self {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(*b),
            RawValue::Number(n) => Value::Number(n.clone()),
            RawValue::String(s) => Value::String(s.clone()),
            RawValue::Date(d) => Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            RawValue::Uuid(u) => Value::String(u.hyphenated().to_string()),
            RawValue::List(items) => Value::Array(items.iter().map(RawValue::to_json).collect()),
            RawValue::Record(record) => Value::Object(
                record
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => RawValue::Number(n),
            Value::String(s) => RawValue::String(s),
            Value::Array(items) => RawValue::List(items.into_iter().map(RawValue::from).collect()),
            Value::Object(map) => RawValue::Record(
                map.into_iter()
                    .map(|(k, v)| (k, RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::String(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::String(s)
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Bool(b)
    }
}

impl From<i64> for RawValue {
    fn from(n: i64) -> Self {
        RawValue::Number(Number::from(n))
    }
}

impl From<Uuid> for RawValue {
    fn from(u: Uuid) -> Self {
        RawValue::Uuid(u)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(d: DateTime<Utc>) -> Self {
        RawValue::Date(d)
    }
}

impl From<RawRecord> for RawValue {
    fn from(record: RawRecord) -> Self {
        RawValue::Record(record)
    }
}

/// Convert a JSON object into a raw record; any other JSON shape yields `None`
pub fn raw_record(value: Value) -> Option<RawRecord> {
    RawValue::from(value).into_record()
}

/// Typed attribute value, produced by coercion against the declared kind
///
/// Serialized adjacently tagged (`{"kind": "date", "value": ...}`) so dates,
/// UUIDs and doubles survive a round trip with their kind intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum AttributeValue {
    /// Explicitly set to absent
    Null,
    Bool(bool),
    Integer(i64),
    /// Decimal kept in its exact wire representation
    Decimal(Number),
    Double(f64),
    String(String),
    Date(DateTime<Utc>),
    Uuid(Uuid),
    Transformable(Value),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Whether this value can be stored under an attribute of `kind`
    ///
    /// Numbers are interchangeable between the non-integer numeric kinds.
    pub fn fits(&self, kind: AttributeKind) -> bool {
        match (self, kind) {
            (AttributeValue::Null, _) | (_, AttributeKind::Transformable) => true,
            (AttributeValue::String(_), AttributeKind::String) => true,
            (AttributeValue::Bool(_), AttributeKind::Boolean) => true,
            (
                AttributeValue::Integer(_),
                AttributeKind::Integer16 | AttributeKind::Integer32 | AttributeKind::Integer64,
            ) => true,
            (
                AttributeValue::Integer(_) | AttributeValue::Decimal(_) | AttributeValue::Double(_),
                AttributeKind::Decimal | AttributeKind::Double | AttributeKind::Float,
            ) => true,
            (AttributeValue::Date(_), AttributeKind::Date) => true,
            (AttributeValue::Uuid(_), AttributeKind::Uuid) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(n) => Some(*n),
            AttributeValue::Integer(n) => Some(*n as f64),
            AttributeValue::Decimal(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            AttributeValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            AttributeValue::Transformable(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AttributeValue::Null => Value::Null,
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Integer(n) => Value::from(*n),
            AttributeValue::Decimal(n) => Value::Number(n.clone()),
            AttributeValue::Double(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
            AttributeValue::String(s) => Value::String(s.clone()),
            AttributeValue::Date(d) => Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            AttributeValue::Uuid(u) => Value::String(u.hyphenated().to_string()),
            AttributeValue::Transformable(v) => v.clone(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        AttributeValue::Integer(n)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

/// Attribute name -> typed value
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Reference from a relationship to its destination record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RelatedRef {
    /// Bare identifier; may need fault resolution
    Identifier { identifier: Identifier },

    /// Object materialized in the same request; used without any fetch
    Object { key: ReferenceKey },
}

impl RelatedRef {
    pub fn identifier(identifier: Identifier) -> Self {
        RelatedRef::Identifier { identifier }
    }

    pub fn object(key: ReferenceKey) -> Self {
        RelatedRef::Object { key }
    }

    /// Destination identifier regardless of how the reference was supplied
    pub fn target(&self) -> &Identifier {
        match self {
            RelatedRef::Identifier { identifier } => identifier,
            RelatedRef::Object { key } => &key.identifier,
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self, RelatedRef::Object { .. })
    }
}

/// Stored value of one relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipValue {
    /// `None` means the relationship is explicitly empty
    ToOne(Option<RelatedRef>),
    ToMany(Vec<RelatedRef>),
}

impl RelationshipValue {
    /// All referenced entries in stored order
    pub fn refs(&self) -> Vec<&RelatedRef> {
        match self {
            RelationshipValue::ToOne(one) => one.iter().collect(),
            RelationshipValue::ToMany(many) => many.iter().collect(),
        }
    }

    pub fn identifiers(&self) -> Vec<Identifier> {
        self.refs().into_iter().map(|r| r.target().clone()).collect()
    }

    pub fn to_json(&self) -> Value {
        match self {
            RelationshipValue::ToOne(None) => Value::Null,
            RelationshipValue::ToOne(Some(r)) => Value::String(r.target().to_string()),
            RelationshipValue::ToMany(many) => Value::Array(
                many.iter()
                    .map(|r| Value::String(r.target().to_string()))
                    .collect(),
            ),
        }
    }
}

/// The attribute and relationship values held by a node or carried by a change
///
/// A key that is absent means "not present / leave untouched"; an attribute set
/// to [`AttributeValue::Null`] or a to-one set to `None` means "set to absent".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeValues {
    #[serde(default)]
    pub attributes: AttributeMap,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipValue>,
}

impl NodeValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_null(mut self, name: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), AttributeValue::Null);
        self
    }

    pub fn with_to_one(mut self, name: impl Into<String>, target: Option<Identifier>) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipValue::ToOne(target.map(RelatedRef::identifier)),
        );
        self
    }

    pub fn with_to_many(
        mut self,
        name: impl Into<String>,
        targets: impl IntoIterator<Item = Identifier>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipValue::ToMany(targets.into_iter().map(RelatedRef::identifier).collect()),
        );
        self
    }

    pub fn with_relationship(mut self, name: impl Into<String>, value: RelationshipValue) -> Self {
        self.relationships.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.relationships.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipValue> {
        self.relationships.get(name)
    }

    /// Overwrite every key present in `incoming`; keys it lacks are untouched
    pub fn merge(&mut self, incoming: &NodeValues) {
        for (name, value) in &incoming.attributes {
            self.attributes.insert(name.clone(), value.clone());
        }
        for (name, value) in &incoming.relationships {
            self.relationships.insert(name.clone(), value.clone());
        }
    }

    /// Flat JSON object of attributes and relationship identifiers
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.attributes {
            map.insert(name.clone(), value.to_json());
        }
        for (name, value) in &self.relationships {
            map.insert(name.clone(), value.to_json());
        }
        Value::Object(map)
    }
}
