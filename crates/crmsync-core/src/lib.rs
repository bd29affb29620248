//! Core domain model shared by the CRM client, the store and the sync pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Short-lived CRM access token. Never persisted, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// One CRM row exactly as the query API returned it.
///
/// Relation traversals arrive flattened, e.g. `Ciudad.id` / `Ciudad.Name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, JsonValue>);

impl RawRecord {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    /// Field rendered as text. Null, missing and empty strings all read as absent.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            JsonValue::String(s) if s.is_empty() => None,
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn float_or(&self, field: &str, default: f64) -> f64 {
        match self.get(field) {
            Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(default),
            Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Integer field; a single-element list (single-choice picklist) is unwrapped.
    pub fn int_or(&self, field: &str, default: i64) -> i64 {
        match self.get(field) {
            Some(JsonValue::Array(items)) if items.len() == 1 => json_as_int(&items[0]).unwrap_or(default),
            Some(value) => json_as_int(value).unwrap_or(default),
            None => default,
        }
    }

    /// Largest non-negative integer in a multi-select field, or the scalar value itself.
    pub fn max_int_or_zero(&self, field: &str) -> i64 {
        match self.get(field) {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(json_as_int)
                .filter(|n| *n >= 0)
                .max()
                .unwrap_or(0),
            Some(value) => json_as_int(value).unwrap_or(0),
            None => 0,
        }
    }

    pub fn flag(&self, field: &str) -> bool {
        match self.get(field) {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }

    pub fn into_inner(self) -> Map<String, JsonValue> {
        self.0
    }
}

impl<K: Into<String>> FromIterator<(K, JsonValue)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

fn json_as_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The entity types mirrored from the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Cities,
    ProjectAttributes,
    MegaProjects,
    Projects,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Cities,
        EntityKind::ProjectAttributes,
        EntityKind::MegaProjects,
        EntityKind::Projects,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Cities => "cities",
            EntityKind::ProjectAttributes => "project_attributes",
            EntityKind::MegaProjects => "mega_projects",
            EntityKind::Projects => "projects",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown entity `{s}`"))
    }
}

/// A single bindable column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(Option<String>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Json(Option<JsonValue>),
}

impl ColumnValue {
    pub fn text(value: impl Into<String>) -> Self {
        ColumnValue::Text(Some(value.into()))
    }

    /// Human-readable rendering used in conflict diagnostics.
    pub fn display(&self) -> String {
        match self {
            ColumnValue::Text(Some(s)) => s.clone(),
            ColumnValue::Text(None) | ColumnValue::Json(None) => "NULL".to_string(),
            ColumnValue::Bool(b) => b.to_string(),
            ColumnValue::Int(n) => n.to_string(),
            ColumnValue::Float(f) => f.to_string(),
            ColumnValue::Json(Some(v)) => v.to_string(),
        }
    }
}

/// Column-name keyed row ready for an upsert statement.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub key: String,
    pub columns: BTreeMap<&'static str, ColumnValue>,
}

impl EntityRow {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            columns: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: &'static str, value: ColumnValue) -> Self {
        self.columns.insert(column, value);
        self
    }

    pub fn set(&mut self, column: &'static str, value: ColumnValue) {
        self.columns.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns.get(column)
    }
}

/// Normalized shape persisted to the store.
pub trait CanonicalEntity {
    /// CRM-assigned identifier, the persistence key.
    fn key(&self) -> &str;
    fn name(&self) -> &str;
    fn to_row(&self) -> EntityRow;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: String,
    pub name: String,
    pub is_public: bool,
}

impl CanonicalEntity for City {
    fn key(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn to_row(&self) -> EntityRow {
        EntityRow::new(&self.id)
            .with("id", ColumnValue::text(&self.id))
            .with("name", ColumnValue::text(&self.name))
            .with("is_public", ColumnValue::Bool(self.is_public))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAttribute {
    pub id: String,
    pub name: String,
}

impl CanonicalEntity for ProjectAttribute {
    fn key(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn to_row(&self) -> EntityRow {
        EntityRow::new(&self.id)
            .with("id", ColumnValue::text(&self.id))
            .with("name", ColumnValue::text(&self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegaProject {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub slogan: Option<String>,
    pub description: Option<String>,
    /// Related attribute records, filled in after the CRM lookup.
    pub attributes: Option<JsonValue>,
    pub gallery: Vec<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub is_public: bool,
}

impl CanonicalEntity for MegaProject {
    fn key(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn to_row(&self) -> EntityRow {
        EntityRow::new(&self.id)
            .with("id", ColumnValue::text(&self.id))
            .with("name", ColumnValue::text(&self.name))
            .with("address", ColumnValue::Text(self.address.clone()))
            .with("slogan", ColumnValue::Text(self.slogan.clone()))
            .with("description", ColumnValue::Text(self.description.clone()))
            .with("attributes", ColumnValue::Json(self.attributes.clone()))
            .with("gallery", ColumnValue::Json(Some(JsonValue::from(self.gallery.clone()))))
            .with("latitude", ColumnValue::Float(self.latitude))
            .with("longitude", ColumnValue::Float(self.longitude))
            .with("is_public", ColumnValue::Bool(self.is_public))
    }
}

/// Commercial project; the CRM id is stored in the `hc` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub hc: String,
    pub name: String,
    pub slogan: Option<String>,
    pub address: Option<String>,
    pub small_description: Option<String>,
    pub long_description: Option<String>,
    pub sic: Option<String>,
    pub sales_room_name: Option<String>,
    pub salary_minimum_count: i64,
    pub discount_description: Option<String>,
    pub price_from_general: f64,
    pub price_up_general: f64,
    pub project_type: Option<String>,
    pub mega_project_id: Option<String>,
    pub status: Option<JsonValue>,
    pub highlighted: bool,
    pub built_area: f64,
    pub private_area: f64,
    pub rooms: i64,
    pub bathrooms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub is_public: bool,
    pub attributes: Option<JsonValue>,
}

impl CanonicalEntity for Project {
    fn key(&self) -> &str {
        &self.hc
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn to_row(&self) -> EntityRow {
        EntityRow::new(&self.hc)
            .with("hc", ColumnValue::text(&self.hc))
            .with("name", ColumnValue::text(&self.name))
            .with("slogan", ColumnValue::Text(self.slogan.clone()))
            .with("address", ColumnValue::Text(self.address.clone()))
            .with("small_description", ColumnValue::Text(self.small_description.clone()))
            .with("long_description", ColumnValue::Text(self.long_description.clone()))
            .with("sic", ColumnValue::Text(self.sic.clone()))
            .with("sales_room_name", ColumnValue::Text(self.sales_room_name.clone()))
            .with("salary_minimum_count", ColumnValue::Int(self.salary_minimum_count))
            .with("discount_description", ColumnValue::Text(self.discount_description.clone()))
            .with("price_from_general", ColumnValue::Float(self.price_from_general))
            .with("price_up_general", ColumnValue::Float(self.price_up_general))
            .with("type", ColumnValue::Text(self.project_type.clone()))
            .with("mega_project_id", ColumnValue::Text(self.mega_project_id.clone()))
            .with("status", ColumnValue::Json(self.status.clone()))
            .with("highlighted", ColumnValue::Bool(self.highlighted))
            .with("built_area", ColumnValue::Float(self.built_area))
            .with("private_area", ColumnValue::Float(self.private_area))
            .with("rooms", ColumnValue::Int(self.rooms))
            .with("bathrooms", ColumnValue::Int(self.bathrooms))
            .with("latitude", ColumnValue::Float(self.latitude))
            .with("longitude", ColumnValue::Float(self.longitude))
            .with("is_public", ColumnValue::Bool(self.is_public))
            .with("attributes", ColumnValue::Json(self.attributes.clone()))
    }
}

/// Unit typology belonging to a [`Project`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typology {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    pub price_from: f64,
    pub price_up: f64,
    pub rooms: i64,
    pub bathrooms: i64,
    pub built_area: f64,
    pub private_area: f64,
}

impl CanonicalEntity for Typology {
    fn key(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn to_row(&self) -> EntityRow {
        EntityRow::new(&self.id)
            .with("id", ColumnValue::text(&self.id))
            .with("project_id", ColumnValue::text(&self.project_id))
            .with("name", ColumnValue::text(&self.name))
            .with("description", ColumnValue::Text(self.description.clone()))
            .with("price_from", ColumnValue::Float(self.price_from))
            .with("price_up", ColumnValue::Float(self.price_up))
            .with("rooms", ColumnValue::Int(self.rooms))
            .with("bathrooms", ColumnValue::Int(self.bathrooms))
            .with("built_area", ColumnValue::Float(self.built_area))
            .with("private_area", ColumnValue::Float(self.private_area))
            .with("plans", ColumnValue::Json(None))
            .with("gallery", ColumnValue::Json(None))
    }
}

/// Result of applying one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Statement ran but touched no row: stored values already matched.
    Unaffected,
}

impl UpsertOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
    }
}

/// Summary of one completed sync job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed_count: usize,
    pub error_count: usize,
    pub unchanged_count: usize,
    pub children_processed: usize,
    pub children_errors: usize,
}
