//! Response Parser and Value Coercion
//!
//! Converts raw records returned by remote requests into typed node values and
//! merges them into the identity cache.
//!
//! # Architecture
//!
//! - **Concrete entity resolution**: a record may carry its own entity name under
//!   the configured discriminator key (default `"classname"`). It must name the
//!   nominal entity or one of its subentities; a fetch against a supertype thus
//!   materialises polymorphic records.
//! - **Attribute coercion**: every declared attribute present in the payload is
//!   coerced by its declared kind. Absent keys are left untouched on merge while
//!   an explicit null is stored as null.
//! - **Relationship coercion**: references may be bare identifiers, identifier
//!   text or nested payloads. Nested payloads on a prefetched key path are parsed
//!   and cached first, then referenced as materialised objects; on any other path
//!   only their identifier is taken.
//!
//! # Failure Policy
//!
//! - Coercion errors abort the record being parsed and surface to the caller.
//! - A failing nested to-one payload aborts its parent record.
//! - A failing item inside a to-many collection is skipped, logged with
//!   `warn!` and recorded in [`MergeReport::rejected`]; the remaining items and
//!   the parent record are still applied.

use crate::db::{IdentityCache, MergeOutcome, RemoteDelegate, StoreError, StoreEvent, StoreResult};
use crate::models::{
    AttributeField, AttributeKind, AttributeValue, EntityModel, Identifier, NodeValues, RawRecord,
    RawValue, ReferenceKey, RelatedRef, RelationshipField, RelationshipValue,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;
use uuid::Uuid;

type BoxFuture<'s, T> = Pin<Box<dyn Future<Output = T> + Send + 's>>;

/// Relationship key paths to expand into nested parsing
///
/// Built from dot paths: `["lines.taxes", "customer"]` expands `lines`, the
/// `taxes` of every line, and `customer`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchTree {
    children: BTreeMap<String, PrefetchTree>,
}

impl PrefetchTree {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut root = PrefetchTree::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.as_ref().split('.').filter(|s| !s.is_empty()) {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }
        root
    }

    pub fn contains(&self, relationship: &str) -> bool {
        self.children.contains_key(relationship)
    }

    pub fn child(&self, relationship: &str) -> Option<&PrefetchTree> {
        self.children.get(relationship)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// A nested item that was skipped under the partial to-many policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    pub entity: String,
    pub relationship: String,
    pub reason: String,
}

/// Outcome of applying a response to the cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Top-level records in response order
    pub objects: Vec<ReferenceKey>,
    /// Records created in the cache (nested records included)
    pub inserted: Vec<ReferenceKey>,
    /// Records whose cached version was bumped (nested records included)
    pub updated: Vec<ReferenceKey>,
    /// Records dropped because their delete is in flight
    pub discarded: Vec<ReferenceKey>,
    /// Nested to-many items skipped because they failed to parse
    pub rejected: Vec<RejectedItem>,
}

impl MergeReport {
    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty()
    }

    /// Event telling subscribers which objects to refresh
    pub fn refresh_event(&self) -> Option<StoreEvent> {
        StoreEvent::refreshed(self.inserted.clone(), self.updated.clone())
    }

    pub fn extend(&mut self, other: MergeReport) {
        self.objects.extend(other.objects);
        self.inserted.extend(other.inserted);
        self.updated.extend(other.updated);
        self.discarded.extend(other.discarded);
        self.rejected.extend(other.rejected);
    }

    fn record(&mut self, key: &ReferenceKey, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted.push(key.clone()),
            MergeOutcome::Updated => self.updated.push(key.clone()),
            MergeOutcome::Discarded => self.discarded.push(key.clone()),
            MergeOutcome::Unchanged => {}
        }
    }
}

/// Typed values of one record, ready to merge
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Concrete entity resolved from the payload
    pub entity: String,
    pub identifier: Identifier,
    pub version: u64,
    pub values: NodeValues,
}

/// Parses raw records against the entity model and merges them into a cache
pub struct ResponseParser<'a> {
    model: &'a EntityModel,
    cache: &'a IdentityCache,
    delegate: &'a dyn RemoteDelegate,
    entity_key: &'a str,
}

impl<'a> ResponseParser<'a> {
    pub fn new(
        cache: &'a IdentityCache,
        delegate: &'a dyn RemoteDelegate,
        entity_key: &'a str,
    ) -> Self {
        Self {
            model: cache.model().as_ref(),
            cache,
            delegate,
            entity_key,
        }
    }

    /// Parse and merge every record of a response
    ///
    /// Stops at the first top-level record that fails; records merged before it
    /// stay cached.
    pub async fn apply_items(
        &self,
        items: &[RawRecord],
        nominal: &str,
        prefetch: &PrefetchTree,
    ) -> StoreResult<MergeReport> {
        self.model.entity(nominal)?;

        let mut report = MergeReport::default();
        for item in items {
            let key = self.apply_item(item, nominal, prefetch, &mut report).await?;
            report.objects.push(key);
        }
        Ok(report)
    }

    /// Parse one record into its concrete entity and typed values
    ///
    /// Nested payloads on prefetched paths are merged into the cache as a side
    /// effect; the record itself is not.
    pub async fn parse(
        &self,
        item: &RawRecord,
        nominal: &str,
        prefetch: &PrefetchTree,
        report: &mut MergeReport,
    ) -> StoreResult<ParsedRecord> {
        let entity = self.concrete_entity(item, nominal)?;

        let identifier = self
            .delegate
            .identifier_from_item(&entity, item)
            .and_then(|raw| Identifier::parse(&raw))
            .ok_or_else(|| StoreError::missing_identifier(&entity))?;
        let version = self.delegate.version_from_item(&entity, item).max(1);

        let mut values = NodeValues::default();
        for field in self.model.attributes(&entity) {
            if let Some(raw) = item.get(&field.name) {
                let value = coerce_attribute(&entity, field, raw)?;
                values.attributes.insert(field.name.clone(), value);
            }
        }

        for rel in self.model.relationships(&entity) {
            let Some(raw) = item.get(&rel.name) else {
                continue;
            };
            let child = prefetch.child(&rel.name);
            let value = if rel.is_to_many() {
                self.coerce_to_many(&entity, rel, raw, child, report).await?
            } else {
                self.coerce_to_one(&entity, rel, raw, child, report).await?
            };
            values.relationships.insert(rel.name.clone(), value);
        }

        Ok(ParsedRecord {
            entity,
            identifier,
            version,
            values,
        })
    }

    /// Parse one record and merge it into the cache
    fn apply_item<'s>(
        &'s self,
        item: &'s RawRecord,
        nominal: &'s str,
        prefetch: &'s PrefetchTree,
        report: &'s mut MergeReport,
    ) -> BoxFuture<'s, StoreResult<ReferenceKey>> {
        Box::pin(async move {
            let parsed = self.parse(item, nominal, prefetch, report).await?;
            let outcome = self
                .cache
                .apply_fetched_values(
                    &parsed.entity,
                    &parsed.identifier,
                    parsed.values,
                    parsed.version,
                )
                .await?;

            let key = ReferenceKey::new(parsed.entity, parsed.identifier);
            report.record(&key, outcome);
            Ok(key)
        })
    }

    fn concrete_entity(&self, item: &RawRecord, nominal: &str) -> StoreResult<String> {
        match item.get(self.entity_key) {
            None | Some(RawValue::Null) => Ok(nominal.to_string()),
            Some(RawValue::String(name)) if self.model.is_kind_of(name, nominal) => {
                Ok(name.clone())
            }
            Some(other) => Err(StoreError::invalid_value_type(
                nominal,
                self.entity_key,
                other,
            )),
        }
    }

    async fn coerce_to_one(
        &self,
        entity: &str,
        rel: &RelationshipField,
        raw: &RawValue,
        prefetch: Option<&PrefetchTree>,
        report: &mut MergeReport,
    ) -> StoreResult<RelationshipValue> {
        if raw.is_null() {
            return Ok(RelationshipValue::ToOne(None));
        }
        let related = self.coerce_related(entity, rel, raw, prefetch, report).await?;
        Ok(RelationshipValue::ToOne(Some(related)))
    }

    async fn coerce_to_many(
        &self,
        entity: &str,
        rel: &RelationshipField,
        raw: &RawValue,
        prefetch: Option<&PrefetchTree>,
        report: &mut MergeReport,
    ) -> StoreResult<RelationshipValue> {
        let items = match raw {
            RawValue::Null => return Ok(RelationshipValue::ToMany(Vec::new())),
            RawValue::List(items) => items,
            other => return Err(StoreError::invalid_value_type(entity, &rel.name, other)),
        };

        let mut refs = Vec::with_capacity(items.len());
        for item in items {
            match self.coerce_related(entity, rel, item, prefetch, report).await {
                Ok(related) => refs.push(related),
                Err(e) => {
                    warn!("Skipping item of {}.{}: {}", entity, rel.name, e);
                    report.rejected.push(RejectedItem {
                        entity: entity.to_string(),
                        relationship: rel.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(RelationshipValue::ToMany(refs))
    }

    async fn coerce_related(
        &self,
        entity: &str,
        rel: &RelationshipField,
        raw: &RawValue,
        prefetch: Option<&PrefetchTree>,
        report: &mut MergeReport,
    ) -> StoreResult<RelatedRef> {
        let identifier = match raw {
            RawValue::Uuid(uuid) => Some(Identifier::from(*uuid)),
            RawValue::String(text) => Identifier::parse(text),
            RawValue::Number(n) => Identifier::parse(&n.to_string()),
            RawValue::Record(nested) => {
                return match prefetch {
                    Some(child) => {
                        let key = self
                            .apply_item(nested, &rel.destination, child, report)
                            .await?;
                        Ok(RelatedRef::object(key))
                    }
                    None => self
                        .delegate
                        .identifier_from_item(&rel.destination, nested)
                        .and_then(|raw| Identifier::parse(&raw))
                        .map(RelatedRef::identifier)
                        .ok_or_else(|| StoreError::missing_identifier(&rel.destination)),
                };
            }
            _ => None,
        };

        identifier
            .map(RelatedRef::identifier)
            .ok_or_else(|| StoreError::invalid_value_type(entity, &rel.name, raw))
    }
}

/// Coerce one wire value to the attribute's declared kind
///
/// Explicit null is accepted for every kind.
pub fn coerce_attribute(
    entity: &str,
    field: &AttributeField,
    raw: &RawValue,
) -> StoreResult<AttributeValue> {
    let invalid = || StoreError::invalid_value_type(entity, &field.name, raw);

    if raw.is_null() {
        return Ok(AttributeValue::Null);
    }

    match field.kind {
        AttributeKind::String => match raw {
            RawValue::String(s) => Ok(AttributeValue::String(s.clone())),
            _ => Err(invalid()),
        },
        AttributeKind::Boolean => match raw {
            RawValue::Bool(b) => Ok(AttributeValue::Bool(*b)),
            RawValue::Number(n) => n
                .as_f64()
                .map(|f| AttributeValue::Bool(f != 0.0))
                .ok_or_else(invalid),
            _ => Err(invalid()),
        },
        AttributeKind::Integer16 | AttributeKind::Integer32 | AttributeKind::Integer64 => {
            let RawValue::Number(n) = raw else {
                return Err(invalid());
            };
            let value = n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .ok_or_else(invalid)?;
            let in_range = match field.kind {
                AttributeKind::Integer16 => i16::try_from(value).is_ok(),
                AttributeKind::Integer32 => i32::try_from(value).is_ok(),
                _ => true,
            };
            if in_range {
                Ok(AttributeValue::Integer(value))
            } else {
                Err(invalid())
            }
        }
        AttributeKind::Decimal => match raw {
            RawValue::Number(n) => Ok(AttributeValue::Decimal(n.clone())),
            _ => Err(invalid()),
        },
        AttributeKind::Double | AttributeKind::Float => match raw {
            RawValue::Number(n) => n.as_f64().map(AttributeValue::Double).ok_or_else(invalid),
            _ => Err(invalid()),
        },
        AttributeKind::Date => match raw {
            RawValue::Date(d) => Ok(AttributeValue::Date(*d)),
            RawValue::String(s) => parse_date(s).map(AttributeValue::Date).ok_or_else(invalid),
            _ => Err(invalid()),
        },
        AttributeKind::Uuid => match raw {
            RawValue::Uuid(u) => Ok(AttributeValue::Uuid(*u)),
            RawValue::String(s) => Uuid::parse_str(s.trim())
                .map(AttributeValue::Uuid)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        AttributeKind::Transformable => match raw {
            RawValue::String(s) => serde_json::from_str(s)
                .map(AttributeValue::Transformable)
                .map_err(|_| invalid()),
            other => Ok(AttributeValue::Transformable(other.to_json())),
        },
    }
}

/// Parse a textual timestamp: RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC) or `YYYY-MM-DD`
fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
