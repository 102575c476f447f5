use crate::db::models::RawStateRow;
use crate::schema;
use crate::services::filter::RawSample;
use crate::utils::format_canonical;
use chrono::FixedOffset;
use diesel::prelude::*;
use diesel::SqliteConnection;

/// Insert-or-refresh `samples` in one transaction.
///
/// A key that is absent is inserted; a key that exists has its value
/// replaced only when it differs. Returns the number of rows inserted or
/// changed, so re-running the same batch returns 0.
pub fn upsert_samples(conn: &mut SqliteConnection, samples: &[RawSample], offset: FixedOffset) -> Result<usize, String> {
    if samples.is_empty() {
        return Ok(0);
    }

    use schema::raw_state::dsl as R;

    conn.transaction::<usize, diesel::result::Error, _>(|conn| {
        let mut written = 0usize;
        for sample in samples {
            let row = RawStateRow {
                ts: format_canonical(sample.timestamp, offset),
                measurement_label: sample.measurement_label.clone(),
                state: sample.value,
            };

            let inserted = diesel::insert_into(R::raw_state)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(conn)?;
            if inserted > 0 {
                written += inserted;
                continue;
            }

            written += diesel::update(
                R::raw_state
                    .filter(R::ts.eq(&row.ts))
                    .filter(R::measurement_label.eq(&row.measurement_label))
                    .filter(R::state.ne(row.state)),
            )
            .set(R::state.eq(row.state))
            .execute(conn)?;
        }
        Ok(written)
    })
    .map_err(|e| format!("upsert samples failed: {}", e))
}
