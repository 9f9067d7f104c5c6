// 💾 Checkpoint Store - schema-tagged snapshots of intermediate and final record sets
//
// A snapshot is independent of Rust types: column list, SHA-256 fingerprint
// of that list, and a CSV payload. Loading verifies the fingerprint against
// the payload header before handing the snapshot back.

use crate::error::{CheckpointError, SinkError};
use crate::source::RawTable;
use chrono::{DateTime, Utc};
use csv::StringRecord;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub table: String,
    pub columns: Vec<String>,
    pub schema_fingerprint: String,
    pub row_count: usize,
    /// Comma-delimited UTF-8 CSV, header included
    pub payload: String,
}

/// A row type with a fixed column list, in serde field order
pub trait TableRow: Serialize {
    const COLUMNS: &'static [&'static str];
}

impl Snapshot {
    /// Serialize typed rows under the row type's column list; empty sets still get a header
    pub fn from_records<T: TableRow>(table: &str, records: &[T]) -> Result<Self, SinkError> {
        if let Some(first) = records.first() {
            let found = serialized_columns(table, first)?;
            if !found.iter().map(String::as_str).eq(T::COLUMNS.iter().copied()) {
                return Err(SinkError::ColumnMismatch {
                    table: table.to_string(),
                    declared: T::COLUMNS.iter().map(|c| c.to_string()).collect(),
                    found,
                });
            }
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(T::COLUMNS)?;
        for record in records {
            writer.serialize(record)?;
        }
        Snapshot::finish(table, writer, records.len())
    }

    /// Snapshot of a normalized table, before typing
    pub fn from_raw(raw: &RawTable) -> Result<Self, SinkError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&raw.headers)?;
        for row in &raw.rows {
            writer.write_record(&row.record)?;
        }
        Snapshot::finish(raw.table.name(), writer, raw.rows.len())
    }

    fn finish(
        table: &str,
        writer: csv::Writer<Vec<u8>>,
        row_count: usize,
    ) -> Result<Self, SinkError> {
        let bytes = writer.into_inner().map_err(|e| SinkError::Buffer {
            table: table.to_string(),
            source: e.into_error(),
        })?;
        let payload = String::from_utf8(bytes)?;
        let columns = header_of(&payload)?;

        Ok(Snapshot {
            table: table.to_string(),
            schema_fingerprint: fingerprint(&columns),
            columns,
            row_count,
            payload,
        })
    }

    /// Re-derive the schema from the payload and compare with the stored tag
    pub fn verify(&self) -> Result<(), CheckpointError> {
        let found = fingerprint(&header_of(&self.payload)?);
        if found != self.schema_fingerprint || fingerprint(&self.columns) != found {
            return Err(CheckpointError::SchemaFingerprint {
                table: self.table.clone(),
                expected: self.schema_fingerprint.clone(),
                found,
            });
        }
        Ok(())
    }

    /// Data rows of the payload, header excluded
    pub fn rows(&self) -> Result<Vec<StringRecord>, SinkError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(self.payload.as_bytes());
        let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// SHA-256 over the ordered column list
pub fn fingerprint(columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// Header csv derives from the serde fields of one row
fn serialized_columns<T: Serialize>(table: &str, record: &T) -> Result<Vec<String>, SinkError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.serialize(record)?;
    let bytes = writer.into_inner().map_err(|e| SinkError::Buffer {
        table: table.to_string(),
        source: e.into_error(),
    })?;
    header_of(&String::from_utf8(bytes)?)
}

fn header_of(payload: &str) -> Result<Vec<String>, SinkError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(payload.as_bytes());
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Listing row; payload left out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub run_id: String,
    pub stage: String,
    pub table: String,
    pub row_count: usize,
    pub schema_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

pub trait CheckpointStore {
    fn save(&mut self, run_id: &str, stage: &str, snapshot: &Snapshot) -> Result<(), CheckpointError>;

    fn load(
        &self,
        run_id: &str,
        stage: &str,
        table: &str,
    ) -> Result<Option<Snapshot>, CheckpointError>;

    /// All entries, or only those of one run, oldest first
    fn list(&self, run_id: Option<&str>) -> Result<Vec<CheckpointEntry>, CheckpointError>;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let conn = Connection::open(path)?;
        setup_checkpoints(&conn)?;
        Ok(SqliteCheckpointStore { conn })
    }

    pub fn in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        setup_checkpoints(&conn)?;
        Ok(SqliteCheckpointStore { conn })
    }
}

pub fn setup_checkpoints(conn: &Connection) -> Result<(), CheckpointError> {
    // WAL keeps readers unblocked while a run writes
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            table_name TEXT NOT NULL,
            columns TEXT NOT NULL,
            schema_fingerprint TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(run_id, stage, table_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id)",
        [],
    )?;

    Ok(())
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&mut self, run_id: &str, stage: &str, snapshot: &Snapshot) -> Result<(), CheckpointError> {
        let columns = serde_json::to_string(&snapshot.columns)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO checkpoints
                (run_id, stage, table_name, columns, schema_fingerprint, row_count, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                stage,
                snapshot.table,
                columns,
                snapshot.schema_fingerprint,
                snapshot.row_count as i64,
                snapshot.payload,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(run_id, stage, table = %snapshot.table, rows = snapshot.row_count, "checkpoint saved");
        Ok(())
    }

    fn load(
        &self,
        run_id: &str,
        stage: &str,
        table: &str,
    ) -> Result<Option<Snapshot>, CheckpointError> {
        let row = self
            .conn
            .query_row(
                "SELECT columns, schema_fingerprint, row_count, payload
                 FROM checkpoints
                 WHERE run_id = ?1 AND stage = ?2 AND table_name = ?3",
                params![run_id, stage, table],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((columns, schema_fingerprint, row_count, payload)) = row else {
            return Ok(None);
        };

        let snapshot = Snapshot {
            table: table.to_string(),
            columns: serde_json::from_str(&columns)?,
            schema_fingerprint,
            row_count: row_count as usize,
            payload,
        };
        snapshot.verify()?;
        Ok(Some(snapshot))
    }

    fn list(&self, run_id: Option<&str>) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, stage, table_name, row_count, schema_fingerprint, created_at
             FROM checkpoints
             WHERE ?1 IS NULL OR run_id = ?1
             ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (run_id, stage, table, row_count, schema_fingerprint, created_at) in rows {
            entries.push(CheckpointEntry {
                run_id,
                stage,
                table,
                row_count: row_count as usize,
                schema_fingerprint,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        Ok(entries)
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// Process-local store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: BTreeMap<(String, String, String), (Snapshot, DateTime<Utc>, u64)>,
    sequence: u64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, run_id: &str, stage: &str, snapshot: &Snapshot) -> Result<(), CheckpointError> {
        self.sequence += 1;
        self.entries.insert(
            (run_id.to_string(), stage.to_string(), snapshot.table.clone()),
            (snapshot.clone(), Utc::now(), self.sequence),
        );
        Ok(())
    }

    fn load(
        &self,
        run_id: &str,
        stage: &str,
        table: &str,
    ) -> Result<Option<Snapshot>, CheckpointError> {
        let key = (run_id.to_string(), stage.to_string(), table.to_string());
        match self.entries.get(&key) {
            Some((snapshot, _, _)) => {
                snapshot.verify()?;
                Ok(Some(snapshot.clone()))
            }
            None => Ok(None),
        }
    }

    fn list(&self, run_id: Option<&str>) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|((run, _, _), _)| run_id.map_or(true, |r| run.as_str() == r))
            .map(|((run, stage, table), (snapshot, created_at, seq))| {
                (
                    *seq,
                    CheckpointEntry {
                        run_id: run.clone(),
                        stage: stage.clone(),
                        table: table.clone(),
                        row_count: snapshot.row_count,
                        schema_fingerprint: snapshot.schema_fingerprint.clone(),
                        created_at: *created_at,
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries.into_iter().map(|(_, entry)| entry).collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceTable;

    #[derive(Serialize)]
    struct Row {
        cod: i64,
        nome: String,
    }

    impl TableRow for Row {
        const COLUMNS: &'static [&'static str] = &["cod", "nome"];
    }

    #[derive(Serialize)]
    struct Misdeclared {
        cod: i64,
    }

    impl TableRow for Misdeclared {
        const COLUMNS: &'static [&'static str] = &["codigo"];
    }

    fn rows() -> Vec<Row> {
        vec![
            Row {
                cod: 1,
                nome: "Centro".to_string(),
            },
            Row {
                cod: 2,
                nome: "Norte, 2".to_string(),
            },
        ]
    }

    #[test]
    fn test_snapshot_from_records() {
        let snapshot = Snapshot::from_records("agencias_tratado", &rows()).unwrap();

        assert_eq!(snapshot.columns, vec!["cod", "nome"]);
        assert_eq!(snapshot.row_count, 2);
        assert_eq!(snapshot.schema_fingerprint.len(), 64);
        assert_eq!(snapshot.rows().unwrap()[1].get(1), Some("Norte, 2"));
        assert!(snapshot.verify().is_ok());
    }

    #[test]
    fn test_empty_record_set_keeps_header() {
        let snapshot = Snapshot::from_records::<Row>("transacoes_rejeitadas", &[]).unwrap();

        assert_eq!(snapshot.columns, vec!["cod", "nome"]);
        assert_eq!(snapshot.payload, "cod,nome\n");
        assert_eq!(snapshot.row_count, 0);
        assert!(snapshot.rows().unwrap().is_empty());
        assert!(snapshot.verify().is_ok());
    }

    #[test]
    fn test_declared_columns_must_match_fields() {
        let err = Snapshot::from_records("t", &[Misdeclared { cod: 1 }]).unwrap_err();
        assert!(matches!(err, SinkError::ColumnMismatch { .. }));
    }

    #[test]
    fn test_snapshot_from_raw_table() {
        let raw = RawTable::parse(SourceTable::Branches, "cod_agencia,nome,uf\n1,Centro,SP\n", b',')
            .unwrap();
        let snapshot = Snapshot::from_raw(&raw).unwrap();

        assert_eq!(snapshot.table, "branches");
        assert_eq!(snapshot.columns, vec!["cod_agencia", "nome", "uf"]);
        assert_eq!(snapshot.row_count, 1);
    }

    #[test]
    fn test_fingerprint_depends_on_column_order() {
        let a = fingerprint(&["a".to_string(), "b".to_string()]);
        let b = fingerprint(&["b".to_string(), "a".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let mut snapshot = Snapshot::from_records("t", &rows()).unwrap();
        snapshot.payload = snapshot.payload.replacen("nome", "name", 1);

        assert!(matches!(
            snapshot.verify(),
            Err(CheckpointError::SchemaFingerprint { .. })
        ));
    }

    #[test]
    fn test_sqlite_round_trip() {
        let mut store = SqliteCheckpointStore::in_memory().unwrap();
        let snapshot = Snapshot::from_records("agencias_tratado", &rows()).unwrap();

        store.save("run-1", "final", &snapshot).unwrap();
        store.save("run-2", "final", &snapshot).unwrap();

        let loaded = store.load("run-1", "final", "agencias_tratado").unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(store.load("run-1", "normalized", "agencias_tratado").unwrap().is_none());

        assert_eq!(store.list(None).unwrap().len(), 2);
        let entries = store.list(Some("run-2")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_count, 2);
    }

    #[test]
    fn test_sqlite_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        let snapshot = Snapshot::from_records("t", &rows()).unwrap();

        {
            let mut store = SqliteCheckpointStore::open(&path).unwrap();
            store.save("run-1", "final", &snapshot).unwrap();
        }

        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(store.load("run-1", "final", "t").unwrap(), Some(snapshot));
    }

    #[test]
    fn test_memory_store_lists_in_save_order() {
        let mut store = MemoryCheckpointStore::new();
        let snapshot = Snapshot::from_records("z_table", &rows()).unwrap();
        let other = Snapshot::from_records("a_table", &rows()).unwrap();

        store.save("run-1", "final", &snapshot).unwrap();
        store.save("run-1", "final", &other).unwrap();

        let tables: Vec<_> = store.list(Some("run-1")).unwrap().into_iter().map(|e| e.table).collect();
        assert_eq!(tables, vec!["z_table", "a_table"]);
        assert_eq!(store.len(), 2);
    }
}
