//! yologuard-store: SQLite persistence for the gallery and the access log.
//!
//! One database file holds enrolled persons, their embeddings (optionally
//! AES-GCM encrypted) and every recorded access event. Writes use
//! `synchronous=FULL`, so a successful return means the data is on disk.

pub mod crypto;
mod events;

pub use crypto::EmbeddingCipher;
pub use events::PersonCount;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use yologuard_core::gallery::{GalleryStore, StoreError};
use yologuard_core::{Embedding, EnrolledPerson, Person, PersonId, PersonMetadata};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding crypto: {0}")]
    Crypto(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persons (
    id            INTEGER PRIMARY KEY,
    name          TEXT NOT NULL,
    faculty       TEXT NOT NULL DEFAULT '',
    program       TEXT NOT NULL DEFAULT '',
    role          TEXT NOT NULL DEFAULT '',
    access_type   TEXT NOT NULL DEFAULT '',
    campus        TEXT NOT NULL DEFAULT '',
    extension     TEXT NOT NULL DEFAULT '',
    semester      TEXT NOT NULL DEFAULT '',
    registered_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    person_id     INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    position      INTEGER NOT NULL,
    model_version TEXT,
    encrypted     INTEGER NOT NULL DEFAULT 0,
    vector        BLOB NOT NULL,
    PRIMARY KEY (person_id, position)
);
CREATE TABLE IF NOT EXISTS access_events (
    id             TEXT PRIMARY KEY,
    person_id      INTEGER,
    person_name    TEXT,
    timestamp      TEXT NOT NULL,
    similarity     REAL NOT NULL,
    confidence_pct REAL NOT NULL,
    site           TEXT NOT NULL,
    track_id       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_access_events_timestamp ON access_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_access_events_person ON access_events(person_id);
";

/// Fixed-width UTC text, so string order equals time order.
pub(crate) fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("timestamp '{s}': {e}")))
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: Option<EmbeddingCipher>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(2))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher: None,
        })
    }

    /// Encrypt embeddings written from now on; decrypt encrypted ones on load.
    pub fn with_cipher(mut self, cipher: EmbeddingCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn person_count(&self) -> Result<u64, DbError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM persons", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn get_person(&self, id: PersonId) -> Result<Option<Person>, DbError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, name, faculty, program, role, access_type, campus, extension,
                        semester, registered_at
                 FROM persons WHERE id = ?1",
                params![id.0 as i64],
                person_row,
            )
            .optional()?;
        row.map(|(person, registered)| finish_person(person, &registered))
            .transpose()
    }

    fn encode_vector(&self, values: &[f32]) -> Result<(Vec<u8>, bool), DbError> {
        let bytes = crypto::f32s_to_bytes(values);
        match &self.cipher {
            Some(cipher) => Ok((cipher.seal(&bytes).map_err(DbError::Crypto)?, true)),
            None => Ok((bytes, false)),
        }
    }

    fn decode_vector(&self, blob: &[u8], encrypted: bool) -> Result<Vec<f32>, String> {
        let bytes = if encrypted {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or("embedding is encrypted but no key is configured")?;
            cipher.open(blob)?
        } else {
            blob.to_vec()
        };
        crypto::bytes_to_f32s(&bytes)
    }

    fn save(&self, entry: &EnrolledPerson) -> Result<(), DbError> {
        let encoded = entry
            .embeddings
            .iter()
            .map(|e| self.encode_vector(&e.values))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let p = &entry.person;
        let m = &p.metadata;
        tx.execute(
            "INSERT INTO persons (id, name, faculty, program, role, access_type, campus,
                                  extension, semester, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, faculty = excluded.faculty,
                program = excluded.program, role = excluded.role,
                access_type = excluded.access_type, campus = excluded.campus,
                extension = excluded.extension, semester = excluded.semester,
                registered_at = excluded.registered_at",
            params![
                p.id.0 as i64,
                p.name,
                m.faculty,
                m.program,
                m.role,
                m.access_type,
                m.campus,
                m.extension,
                m.semester,
                encode_time(&p.registered_at),
            ],
        )?;
        tx.execute(
            "DELETE FROM embeddings WHERE person_id = ?1",
            params![p.id.0 as i64],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO embeddings (person_id, position, model_version, encrypted, vector)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (position, (embedding, (blob, encrypted))) in
                entry.embeddings.iter().zip(&encoded).enumerate()
            {
                insert.execute(params![
                    p.id.0 as i64,
                    position as i64,
                    embedding.model_version,
                    *encrypted,
                    blob,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(person = %p.id, embeddings = entry.embeddings.len(), "person saved");
        Ok(())
    }

    fn load(&self) -> Result<Vec<EnrolledPerson>, StoreError> {
        let conn = self.conn();
        let mut persons_stmt = conn
            .prepare(
                "SELECT id, name, faculty, program, role, access_type, campus, extension,
                        semester, registered_at
                 FROM persons ORDER BY id",
            )
            .map_err(DbError::from)?;
        let rows = persons_stmt
            .query_map([], person_row)
            .map_err(DbError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DbError::from)?;

        let mut embeddings_stmt = conn
            .prepare(
                "SELECT model_version, encrypted, vector FROM embeddings
                 WHERE person_id = ?1 ORDER BY position",
            )
            .map_err(DbError::from)?;

        let mut out = Vec::with_capacity(rows.len());
        for (person, registered) in rows {
            let id = person.id;
            let person = finish_person(person, &registered).map_err(|e| StoreError::Corrupt {
                id,
                reason: e.to_string(),
            })?;

            let raw = embeddings_stmt
                .query_map(params![id.0 as i64], |r| {
                    Ok((
                        r.get::<_, Option<String>>(0)?,
                        r.get::<_, bool>(1)?,
                        r.get::<_, Vec<u8>>(2)?,
                    ))
                })
                .map_err(DbError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(DbError::from)?;

            let mut embeddings = Vec::with_capacity(raw.len());
            for (model_version, encrypted, blob) in raw {
                let values = self
                    .decode_vector(&blob, encrypted)
                    .map_err(|reason| StoreError::Corrupt { id, reason })?;
                embeddings.push(Embedding {
                    values,
                    model_version,
                });
            }
            out.push(EnrolledPerson { person, embeddings });
        }
        Ok(out)
    }
}

type PersonRow = (Person, String);

fn person_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PersonRow> {
    let person = Person {
        id: PersonId(r.get::<_, i64>(0)? as u64),
        name: r.get(1)?,
        metadata: PersonMetadata {
            faculty: r.get(2)?,
            program: r.get(3)?,
            role: r.get(4)?,
            access_type: r.get(5)?,
            campus: r.get(6)?,
            extension: r.get(7)?,
            semester: r.get(8)?,
        },
        registered_at: DateTime::<Utc>::MIN_UTC,
    };
    Ok((person, r.get(9)?))
}

fn finish_person(mut person: Person, registered: &str) -> Result<Person, DbError> {
    person.registered_at = decode_time(registered)?;
    Ok(person)
}

impl GalleryStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<EnrolledPerson>, StoreError> {
        self.load()
    }

    fn save_person(&self, entry: &EnrolledPerson) -> Result<(), StoreError> {
        Ok(self.save(entry)?)
    }

    fn delete_person(&self, id: PersonId) -> Result<bool, StoreError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM embeddings WHERE person_id = ?1",
            params![id.0 as i64],
        )
        .map_err(DbError::from)?;
        let removed = conn
            .execute("DELETE FROM persons WHERE id = ?1", params![id.0 as i64])
            .map_err(DbError::from)?;
        Ok(removed > 0)
    }
}
