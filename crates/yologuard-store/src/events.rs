//! Access log table: the `AccessLogger` sink and its read queries.

use crate::{decode_time, encode_time, DbError, SqliteStore};
use chrono::{DateTime, Local, TimeZone, Utc};
use rusqlite::params;
use serde::Serialize;
use yologuard_core::{AccessEvent, AccessLogger, LogDeliveryError, PersonId};

/// Number of recorded accesses for one known person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonCount {
    pub person_id: PersonId,
    pub person_name: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

const EVENT_COLUMNS: &str =
    "id, person_id, person_name, timestamp, similarity, confidence_pct, site, track_id";

fn event_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(AccessEvent, String, String)> {
    let event = AccessEvent {
        id: uuid::Uuid::nil(),
        person_id: r.get::<_, Option<i64>>(1)?.map(|id| PersonId(id as u64)),
        person_name: r.get(2)?,
        timestamp: DateTime::<Utc>::MIN_UTC,
        similarity: r.get::<_, f64>(4)? as f32,
        confidence_pct: r.get::<_, f64>(5)? as f32,
        site: r.get(6)?,
        track_id: r.get::<_, i64>(7)? as u64,
    };
    Ok((event, r.get(0)?, r.get(3)?))
}

fn finish_event(
    (mut event, id, timestamp): (AccessEvent, String, String),
) -> Result<AccessEvent, DbError> {
    event.id = uuid::Uuid::parse_str(&id)
        .map_err(|e| DbError::Corrupt(format!("event id '{id}': {e}")))?;
    event.timestamp = decode_time(&timestamp)?;
    Ok(event)
}

impl SqliteStore {
    pub fn append_event(&self, event: &AccessEvent) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO access_events
                 (id, person_id, person_name, timestamp, similarity, confidence_pct, site, track_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.to_string(),
                event.person_id.map(|id| id.0 as i64),
                event.person_name,
                encode_time(&event.timestamp),
                event.similarity as f64,
                event.confidence_pct as f64,
                event.site,
                event.track_id as i64,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<AccessEvent>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM access_events
             ORDER BY timestamp DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_event).collect()
    }

    /// Events at or after `since`, oldest first.
    pub fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<AccessEvent>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM access_events
             WHERE timestamp >= ?1 ORDER BY timestamp, rowid"
        ))?;
        let rows = stmt
            .query_map(params![encode_time(&since)], event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_event).collect()
    }

    pub fn count_since(&self, since: DateTime<Utc>) -> Result<u64, DbError> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM access_events WHERE timestamp >= ?1",
            params![encode_time(&since)],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Accesses since local midnight.
    pub fn events_today(&self) -> Result<u64, DbError> {
        self.count_since(local_midnight(Local::now()))
    }

    /// Known persons by number of accesses, most frequent first.
    pub fn counts_by_person(&self) -> Result<Vec<PersonCount>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT person_id, MAX(person_name), COUNT(*), MAX(timestamp)
             FROM access_events WHERE person_id IS NOT NULL
             GROUP BY person_id ORDER BY COUNT(*) DESC, person_id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, count, last)| {
                Ok(PersonCount {
                    person_id: PersonId(id as u64),
                    person_name: name.unwrap_or_default(),
                    count: count as u64,
                    last_seen: decode_time(&last)?,
                })
            })
            .collect()
    }
}

fn local_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> DateTime<Utc> {
    let tz = now.timezone();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc))
}

impl AccessLogger for SqliteStore {
    fn record(&self, event: &AccessEvent) -> Result<(), LogDeliveryError> {
        self.append_event(event).map_err(|e| match e {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                LogDeliveryError::Rejected {
                    id: event.id,
                    reason: "duplicate event id".into(),
                }
            }
            other => LogDeliveryError::Unavailable(other.to_string()),
        })
    }
}
