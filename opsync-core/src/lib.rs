//! OPSYNC Core - Shared Types
//!
//! Identifiers, the entity contract, change events, query filters and the
//! normalized error taxonomy. Every other opsync crate depends on this one.

pub mod domain;
pub mod entity;
pub mod error;
pub mod event;
pub mod filter;
pub mod identity;
pub mod report;
pub mod validate;

pub use domain::{
    DynamicRecord, InventoryCount, InventoryPatch, InventoryValidator, Planning, PlanningPatch,
    PlanningStatus, PlanningValidator,
};
pub use entity::{Entity, Record};
pub use error::{normalize, ErrorKind, ErrorMeta, NormalizedError, RawFailure, RecoveryAction};
pub use event::{ChangeEvent, ChangeKind, RawChange, RecordRef};
pub use filter::{FilterExpr, FilterOperator, QueryFilter};
pub use identity::{CollectionName, EntryKey, LocalId, PartitionKey, RecordId, Timestamp};
pub use report::{CaptureError, ErrorReport, ErrorReporter, ExecutionMode, MonitoringSink};
pub use validate::{AcceptAll, FnValidator, ValidationError, Validator};
