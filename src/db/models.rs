//! Diesel model structs for the sample table, the two catalogs and the
//! checkpoint table.
//!
//! Timestamps are stored as text in the canonical zoned form produced by
//! [`crate::utils::format_canonical`], so lexical order matches time order.

use diesel::prelude::*;

use crate::schema;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::raw_state, check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawStateRow {
    pub ts: String,
    pub measurement_label: String,
    pub state: f64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::label_catalog, check_for_backend(diesel::sqlite::Sqlite))]
pub struct LabelEntry {
    pub measurement_label: String,
    pub measurement_type: Option<String>,
    pub zone_name: Option<String>,
    pub device_friendly_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::device_catalog, check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeviceEntry {
    pub device_friendly_name: String,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub room: Option<String>,
    pub device_class: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::sync_checkpoint, check_for_backend(diesel::sqlite::Sqlite))]
pub struct Checkpoint {
    /// `"base:" + measurement type`
    pub source: String,
    pub last_ts: String,
    pub updated_at: String,
}
