//! Core listing data model shared by the harvest, history and mirror crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "rentwatch-core";

/// Field stamped on every harvested record with the facet that produced it.
pub const DIMENSION_FIELD: &str = "dimension";
/// Field stamped on every harvested record with the calendar date of the run.
pub const INSERT_DATE_FIELD: &str = "insert_date";
/// Positional sort key added to mirror rows.
pub const RUN_FIELD: &str = "run";
/// Fields forming the dedup key, in key order.
pub const DEDUP_KEY_FIELDS: [&str; 3] = ["propertyCode", "price", "size"];

pub const INSERT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Closed set of furnishing facets the catalog can be queried by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Furnishing {
    /// Fully furnished homes.
    Furnished,
    /// Unfurnished except for an equipped kitchen.
    FurnishedKitchen,
}

impl Furnishing {
    pub const ALL: [Furnishing; 2] = [Furnishing::Furnished, Furnishing::FurnishedKitchen];

    pub fn as_str(&self) -> &'static str {
        match self {
            Furnishing::Furnished => "furnished",
            Furnishing::FurnishedKitchen => "furnishedKitchen",
        }
    }
}

impl fmt::Display for Furnishing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown furnishing facet `{0}` (expected one of: furnished, furnishedKitchen)")]
pub struct UnknownFacet(pub String);

impl FromStr for Furnishing {
    type Err = UnknownFacet;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Furnishing::ALL
            .into_iter()
            .find(|facet| facet.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownFacet(s.to_string()))
    }
}

/// Render a field value the way it is stored in flat tables and the mirror.
///
/// Strings are kept verbatim, `null` becomes the empty cell, booleans use the
/// `True`/`False` spelling of the legacy history files and nested values are
/// serialized as JSON.
pub fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Bool(true) => "True".to_string(),
        JsonValue::Bool(false) => "False".to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(_) | JsonValue::Object(_) => value.to_string(),
    }
}

/// One property listing: field name to value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingRecord {
    fields: BTreeMap<String, JsonValue>,
}

impl ListingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from an API element, flattening nested values to JSON strings.
    pub fn from_api_object(object: serde_json::Map<String, JsonValue>) -> Self {
        let fields = object
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    JsonValue::Array(_) | JsonValue::Object(_) => {
                        JsonValue::String(value.to_string())
                    }
                    scalar => scalar,
                };
                (name, value)
            })
            .collect();
        Self { fields }
    }

    pub fn from_text_cells<I, K, V>(cells: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: cells
                .into_iter()
                .map(|(k, v)| (k.into(), JsonValue::String(v.into())))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<JsonValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Cell text for `name`, or the empty string when the field is absent.
    pub fn text(&self, name: &str) -> String {
        self.fields.get(name).map(cell_text).unwrap_or_default()
    }

    /// Tag the record with the facet that produced it and the run date.
    pub fn stamp(&mut self, facet: Furnishing, run_date: NaiveDate) {
        self.insert(DIMENSION_FIELD, facet.as_str());
        self.insert(
            INSERT_DATE_FIELD,
            run_date.format(INSERT_DATE_FORMAT).to_string(),
        );
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            property_code: self.text(DEDUP_KEY_FIELDS[0]).trim().to_string(),
            price: normalize_numeric(&self.text(DEDUP_KEY_FIELDS[1])),
            size: normalize_numeric(&self.text(DEDUP_KEY_FIELDS[2])),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Identity used to decide that two rows describe "the same listing".
///
/// This is not a source-guaranteed identifier: two distinct listings with an
/// empty or reused `propertyCode` and equal price and size collapse into one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub property_code: String,
    pub price: String,
    pub size: String,
}

/// `1500`, `1500.0` and ` 1500 ` all normalize to `1500`; non-numeric text is trimmed only.
pub fn normalize_numeric(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => format!("{v}"),
        _ => trimmed.to_string(),
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageResult {
    pub records: Vec<ListingRecord>,
    /// Upper bound on pages for the current query, as last reported.
    pub total_pages: u32,
    /// 1-based index of this page.
    pub actual_page: u32,
    /// Declared total record count; advisory only.
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCount {
    pub facet: Furnishing,
    pub pages: u32,
    pub records: usize,
}

/// Records of a whole harvest run, dimension-major then page-ascending.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HarvestBatch {
    records: Vec<ListingRecord>,
    facet_counts: Vec<FacetCount>,
}

impl HarvestBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every record a facet produced; records keep their page order.
    pub fn push_facet(&mut self, facet: Furnishing, pages: u32, records: Vec<ListingRecord>) {
        self.facet_counts.push(FacetCount {
            facet,
            pages,
            records: records.len(),
        });
        self.records.extend(records);
    }

    pub fn records(&self) -> &[ListingRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ListingRecord> {
        self.records
    }

    pub fn facet_counts(&self) -> &[FacetCount] {
        &self.facet_counts
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A record flattened for the key/attribute mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorRow {
    /// Zero-based position in the write batch; range key.
    pub run: u64,
    /// Every other attribute as text, `insert_date` (partition key) included.
    pub attributes: BTreeMap<String, String>,
}

impl MirrorRow {
    pub fn project(records: &[ListingRecord]) -> Vec<MirrorRow> {
        records
            .iter()
            .enumerate()
            .map(|(idx, record)| MirrorRow {
                run: idx as u64,
                attributes: record
                    .iter()
                    .filter(|(name, _)| *name != RUN_FIELD)
                    .map(|(name, value)| (name.to_string(), cell_text(value)))
                    .collect(),
            })
            .collect()
    }

    pub fn insert_date(&self) -> Option<&str> {
        self.attributes.get(INSERT_DATE_FIELD).map(String::as_str)
    }
}
