//! Dashboard entities synchronized through opsync stores.
//!
//! `Planning` and `InventoryCount` are the two typed collections the
//! dashboard keeps live; `DynamicRecord` backs stores over arbitrary named
//! queries where the row shape is only known at runtime.

use crate::entity::Entity;
use crate::identity::{PartitionKey, Timestamp};
use crate::validate::{ValidationError, Validator};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

// ============================================================================
// PLANNING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlanningStatus {
    #[default]
    Scheduled,
    InProgress,
    Done,
    Cancelled,
}

/// A warehouse planning slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planning {
    #[serde(rename = "tenant_id")]
    pub tenant: PartitionKey,
    pub date: NaiveDate,
    /// Slot start, `HH:MM`.
    pub hour: String,
    #[serde(default)]
    pub status: PlanningStatus,
    #[serde(default)]
    pub is_forecast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Planning {
    pub fn new(tenant: impl Into<PartitionKey>, date: NaiveDate, hour: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            date,
            hour: hour.into(),
            status: PlanningStatus::default(),
            is_forecast: false,
            title: None,
            notes: None,
        }
    }

    /// Calendar order: date, then hour.
    pub fn by_schedule(a: &Self, b: &Self) -> Ordering {
        a.date.cmp(&b.date).then_with(|| a.hour.cmp(&b.hour))
    }
}

/// Partial update for a [`Planning`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PlanningStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_forecast: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PlanningPatch {
    pub fn status(status: PlanningStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl Entity for Planning {
    type Patch = PlanningPatch;
    const PARTITION_FIELD: &'static str = "tenant_id";

    fn partition_key(&self) -> &PartitionKey {
        &self.tenant
    }

    fn apply_patch(&mut self, patch: &PlanningPatch) {
        if let Some(date) = patch.date {
            self.date = date;
        }
        if let Some(hour) = &patch.hour {
            self.hour = hour.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(is_forecast) = patch.is_forecast {
            self.is_forecast = is_forecast;
        }
        if let Some(title) = &patch.title {
            self.title = Some(title.clone());
        }
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
    }
}

/// Rejects plannings without a well-formed `HH:MM` hour.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanningValidator;

impl Validator<Planning> for PlanningValidator {
    fn validate_new(&self, candidate: &Planning) -> Result<(), ValidationError> {
        if candidate.tenant.as_str().trim().is_empty() {
            return Err(ValidationError::missing("tenant_id"));
        }
        check_hour(&candidate.hour)
    }

    fn validate_patch(&self, patch: &PlanningPatch) -> Result<(), ValidationError> {
        match &patch.hour {
            Some(hour) => check_hour(hour),
            None => Ok(()),
        }
    }
}

fn check_hour(hour: &str) -> Result<(), ValidationError> {
    if hour.trim().is_empty() {
        return Err(ValidationError::missing("hour"));
    }
    chrono::NaiveTime::parse_from_str(hour, "%H:%M")
        .map(|_| ())
        .map_err(|_| ValidationError::invalid("hour", format!("expected HH:MM, got '{}'", hour)))
}

// ============================================================================
// INVENTORY COUNT
// ============================================================================

/// One counted line of a stock take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryCount {
    #[serde(rename = "tenant_id")]
    pub tenant: PartitionKey,
    pub location: String,
    pub sku: String,
    pub counted_quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counted_at: Option<Timestamp>,
}

impl InventoryCount {
    pub fn by_location(a: &Self, b: &Self) -> Ordering {
        a.location.cmp(&b.location).then_with(|| a.sku.cmp(&b.sku))
    }

    /// Counted minus expected, when an expectation exists.
    pub fn variance(&self) -> Option<i64> {
        self.expected_quantity.map(|expected| self.counted_quantity - expected)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counted_quantity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_quantity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counted_at: Option<Timestamp>,
}

impl Entity for InventoryCount {
    type Patch = InventoryPatch;
    const PARTITION_FIELD: &'static str = "tenant_id";

    fn partition_key(&self) -> &PartitionKey {
        &self.tenant
    }

    fn apply_patch(&mut self, patch: &InventoryPatch) {
        if let Some(counted) = patch.counted_quantity {
            self.counted_quantity = counted;
        }
        if let Some(expected) = patch.expected_quantity {
            self.expected_quantity = Some(expected);
        }
        if let Some(counted_at) = patch.counted_at {
            self.counted_at = Some(counted_at);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryValidator;

impl Validator<InventoryCount> for InventoryValidator {
    fn validate_new(&self, candidate: &InventoryCount) -> Result<(), ValidationError> {
        if candidate.location.trim().is_empty() {
            return Err(ValidationError::missing("location"));
        }
        if candidate.sku.trim().is_empty() {
            return Err(ValidationError::missing("sku"));
        }
        check_quantity(candidate.counted_quantity)
    }

    fn validate_patch(&self, patch: &InventoryPatch) -> Result<(), ValidationError> {
        match patch.counted_quantity {
            Some(quantity) => check_quantity(quantity),
            None => Ok(()),
        }
    }
}

fn check_quantity(quantity: i64) -> Result<(), ValidationError> {
    if quantity < 0 {
        return Err(ValidationError::invalid(
            "counted_quantity",
            "must be >= 0",
        ));
    }
    Ok(())
}

// ============================================================================
// DYNAMIC RECORD
// ============================================================================

/// A row whose shape is only known at runtime.
///
/// The patch is a shallow merge: every key in the patch overwrites the
/// corresponding field; keys absent from the patch are untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicRecord {
    pub partition_key: PartitionKey,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DynamicRecord {
    pub fn new(partition_key: impl Into<PartitionKey>) -> Self {
        Self {
            partition_key: partition_key.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The row as a JSON object, partition key included.
    pub fn to_object(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert(
            "partition_key".to_string(),
            Value::String(self.partition_key.as_str().to_string()),
        );
        Value::Object(object)
    }
}

impl Entity for DynamicRecord {
    type Patch = Map<String, Value>;

    fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (field, value) in patch {
            if field == "partition_key" {
                continue;
            }
            self.fields.insert(field.clone(), value.clone());
        }
    }
}
