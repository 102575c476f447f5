use crate::client::RangeSource;
use crate::db::models as dbm;
use crate::models::api;
use crate::schema;
use crate::utils::Pacer;
use diesel::prelude::*;
use diesel::SqliteConnection;
use log::{debug, info, warn};

/// Outcome of the catalog refresh at the start of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogStatus {
    Disabled,
    Synced { labels: usize, devices: usize },
    /// At least one catalog could not be refreshed; its stored rows are kept as they were.
    Failed(String),
}

impl CatalogStatus {
    pub fn failed(&self) -> bool {
        matches!(self, CatalogStatus::Failed(_))
    }
}

/// Refresh both catalogs; errors are logged and reported, never propagated.
pub fn sync_all<S: RangeSource>(conn: &mut SqliteConnection, source: &S, pacer: &mut Pacer) -> CatalogStatus {
    info!("Catalog: syncing label and device catalogs");
    pacer.wait();
    let labels = sync_labels(conn, source);
    pacer.wait();
    let devices = sync_devices(conn, source);

    match (labels, devices) {
        (Ok(labels), Ok(devices)) => {
            info!("Catalog: refreshed {} label(s) and {} device(s)", labels, devices);
            CatalogStatus::Synced { labels, devices }
        }
        (labels, devices) => {
            let errors = [labels.err(), devices.err()].into_iter().flatten().collect::<Vec<_>>().join("; ");
            warn!("Catalog: sync failed, continuing with stored catalog: {}", errors);
            CatalogStatus::Failed(errors)
        }
    }
}

/// Replace label metadata (`/mim`) by key; returns the number of entries upserted.
pub fn sync_labels<S: RangeSource>(conn: &mut SqliteConnection, source: &S) -> Result<usize, String> {
    let labels = source.fetch_labels().map_err(|e| format!("fetch label catalog failed: {}", e))?;
    let total = labels.len();
    let rows: Vec<dbm::LabelEntry> = labels.into_iter().filter_map(label_entry).collect();
    if rows.len() < total {
        debug!("Catalog: skipped {} label entries without measurementLabel", total - rows.len());
    }
    upsert_labels(conn, &rows)
}

/// Replace device metadata (`/aim`) by key; returns the number of entries upserted.
pub fn sync_devices<S: RangeSource>(conn: &mut SqliteConnection, source: &S) -> Result<usize, String> {
    let devices = source.fetch_devices().map_err(|e| format!("fetch device catalog failed: {}", e))?;
    let total = devices.len();
    let rows: Vec<dbm::DeviceEntry> = devices.into_iter().filter_map(device_entry).collect();
    if rows.len() < total {
        debug!("Catalog: skipped {} device entries without deviceFriendlyName", total - rows.len());
    }
    upsert_devices(conn, &rows)
}

fn label_entry(info: api::LabelInfo) -> Option<dbm::LabelEntry> {
    Some(dbm::LabelEntry {
        measurement_label: info.measurement_label?,
        measurement_type: info.measurement_type,
        zone_name: info.zone_name,
        device_friendly_name: info.device_friendly_name,
    })
}

fn device_entry(info: api::DeviceInfo) -> Option<dbm::DeviceEntry> {
    Some(dbm::DeviceEntry {
        device_friendly_name: info.device_friendly_name?,
        building: info.building,
        floor: info.floor,
        room: info.room,
        device_class: info.device_class,
        mac_address: info.mac_address,
        ip_address: info.ip_address,
    })
}

fn upsert_labels(conn: &mut SqliteConnection, rows: &[dbm::LabelEntry]) -> Result<usize, String> {
    use schema::label_catalog::dsl as L;

    conn.transaction::<usize, diesel::result::Error, _>(|conn| {
        for row in rows {
            diesel::insert_into(L::label_catalog)
                .values(row)
                .on_conflict(L::measurement_label)
                .do_update()
                .set((
                    L::measurement_type.eq(row.measurement_type.clone()),
                    L::zone_name.eq(row.zone_name.clone()),
                    L::device_friendly_name.eq(row.device_friendly_name.clone()),
                ))
                .execute(conn)?;
        }
        Ok(rows.len())
    })
    .map_err(|e| format!("upsert label catalog failed: {}", e))
}

fn upsert_devices(conn: &mut SqliteConnection, rows: &[dbm::DeviceEntry]) -> Result<usize, String> {
    use schema::device_catalog::dsl as D;

    conn.transaction::<usize, diesel::result::Error, _>(|conn| {
        for row in rows {
            diesel::insert_into(D::device_catalog)
                .values(row)
                .on_conflict(D::device_friendly_name)
                .do_update()
                .set((
                    D::building.eq(row.building.clone()),
                    D::floor.eq(row.floor.clone()),
                    D::room.eq(row.room.clone()),
                    D::device_class.eq(row.device_class.clone()),
                    D::mac_address.eq(row.mac_address.clone()),
                    D::ip_address.eq(row.ip_address.clone()),
                ))
                .execute(conn)?;
        }
        Ok(rows.len())
    })
    .map_err(|e| format!("upsert device catalog failed: {}", e))
}
