// 📂 Source Reader - delimited text → raw tables
// Reads each source table once per run; no typing happens here beyond the header check.

use crate::error::SourceError;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// SOURCE TABLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    Branches,
    Clients,
    Employees,
    BranchEmployeeLinks,
    Accounts,
    CreditProposals,
    Transactions,
}

impl SourceTable {
    pub const ALL: [SourceTable; 7] = [
        SourceTable::Branches,
        SourceTable::Clients,
        SourceTable::Employees,
        SourceTable::BranchEmployeeLinks,
        SourceTable::Accounts,
        SourceTable::CreditProposals,
        SourceTable::Transactions,
    ];

    /// Logical table name used across the transform
    pub fn name(&self) -> &'static str {
        match self {
            SourceTable::Branches => "branches",
            SourceTable::Clients => "clients",
            SourceTable::Employees => "employees",
            SourceTable::BranchEmployeeLinks => "branch_employee_links",
            SourceTable::Accounts => "accounts",
            SourceTable::CreditProposals => "credit_proposals",
            SourceTable::Transactions => "transactions",
        }
    }

    /// File stem of the source export
    pub fn file_stem(&self) -> &'static str {
        match self {
            SourceTable::Branches => "agencias",
            SourceTable::Clients => "clientes",
            SourceTable::Employees => "colaboradores",
            SourceTable::BranchEmployeeLinks => "colaborador_agencia",
            SourceTable::Accounts => "contas",
            SourceTable::CreditProposals => "propostas_credito",
            SourceTable::Transactions => "transacoes",
        }
    }

    /// Column holding the table's unique identifier
    pub fn key_column(&self) -> Option<&'static str> {
        match self {
            SourceTable::Branches => Some("cod_agencia"),
            SourceTable::Clients => Some("cod_cliente"),
            SourceTable::Employees => Some("cod_colaborador"),
            SourceTable::BranchEmployeeLinks => None,
            SourceTable::Accounts => Some("num_conta"),
            SourceTable::CreditProposals => Some("cod_proposta"),
            SourceTable::Transactions => Some("cod_transacao"),
        }
    }

    /// Columns that must be present in the header
    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            SourceTable::Branches => &["cod_agencia", "nome", "uf"],
            SourceTable::Clients => &["cod_cliente", "primeiro_nome", "data_nascimento"],
            SourceTable::Employees => &["cod_colaborador", "primeiro_nome"],
            SourceTable::BranchEmployeeLinks => &["cod_colaborador", "cod_agencia"],
            SourceTable::Accounts => &[
                "num_conta",
                "cod_cliente",
                "cod_agencia",
                "tipo_conta",
                "data_abertura",
            ],
            SourceTable::CreditProposals => &[
                "cod_proposta",
                "data_entrada_proposta",
                "valor_proposta",
                "status_proposta",
            ],
            SourceTable::Transactions => &[
                "cod_transacao",
                "num_conta",
                "data_transacao",
                "nome_transacao",
                "valor_transacao",
            ],
        }
    }
}

impl std::fmt::Display for SourceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// RAW TABLE
// ============================================================================

/// One source row with its provenance line
#[derive(Debug, Clone)]
pub struct RawRow {
    pub line: u64,
    pub record: StringRecord,
}

#[derive(Debug, Clone)]
pub struct RawTable {
    pub table: SourceTable,
    pub headers: StringRecord,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    /// Parse delimited text into a raw table
    pub fn parse(table: SourceTable, text: &str, delimiter: u8) -> Result<Self, csv::Error> {
        let mut rdr = ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(Trim::Headers)
            .from_reader(text.as_bytes());

        let headers = rdr.headers()?.clone();
        let mut rows = Vec::new();

        for result in rdr.records() {
            let record = result?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            rows.push(RawRow { line, record });
        }

        Ok(RawTable {
            table,
            headers,
            rows,
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn key_index(&self) -> Option<usize> {
        self.table.key_column().and_then(|c| self.column_index(c))
    }

    /// Raw identifier cell of a row, when present and non-blank
    pub fn key_of(&self, row: &RawRow) -> Option<String> {
        row_key(self.key_index(), row)
    }

    /// Schema-mismatch check against the table's required columns
    pub fn check_schema(&self) -> Result<(), SourceError> {
        for column in self.table.required_columns() {
            if self.column_index(column).is_none() {
                return Err(SourceError::SchemaMismatch {
                    table: self.table.name().to_string(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub(crate) fn row_key(key_index: Option<usize>, row: &RawRow) -> Option<String> {
    key_index
        .and_then(|idx| row.record.get(idx))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// All source tables of one run, keyed by table
pub type SourceSet = BTreeMap<SourceTable, RawTable>;

// ============================================================================
// READERS
// ============================================================================

/// Source Reader seam: one raw table per call
pub trait SourceReader {
    fn read_table(&self, table: SourceTable) -> Result<RawTable, SourceError>;
}

/// Read every known table, stopping at the first failure
pub fn read_all(reader: &dyn SourceReader) -> Result<SourceSet, SourceError> {
    let mut set = SourceSet::new();
    for table in SourceTable::ALL {
        let raw = reader.read_table(table)?;
        info!(table = table.name(), rows = raw.len(), "source table loaded");
        set.insert(table, raw);
    }
    Ok(set)
}

/// Reads `<dir>/<file_stem>.csv` for each table
pub struct CsvDirectoryReader {
    dir: PathBuf,
    delimiter: u8,
}

impl CsvDirectoryReader {
    pub fn new<P: AsRef<Path>>(dir: P, delimiter: u8) -> Self {
        CsvDirectoryReader {
            dir: dir.as_ref().to_path_buf(),
            delimiter,
        }
    }

    pub fn path_for(&self, table: SourceTable) -> PathBuf {
        self.dir.join(format!("{}.csv", table.file_stem()))
    }
}

impl SourceReader for CsvDirectoryReader {
    fn read_table(&self, table: SourceTable) -> Result<RawTable, SourceError> {
        let path = self.path_for(table);
        if !path.exists() {
            return Err(SourceError::NotFound {
                table: table.name().to_string(),
                path,
            });
        }

        let bytes = fs::read(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        let text = decode_text(bytes, &path);

        let raw = RawTable::parse(table, &text, self.delimiter).map_err(|source| {
            SourceError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        raw.check_schema()?;

        debug!(path = %path.display(), "read source file");
        Ok(raw)
    }
}

/// UTF-8 first, Latin-1 as the fallback encoding
pub fn decode_text(bytes: Vec<u8>, path: &Path) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), "file is not valid UTF-8, decoding as Latin-1");
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    }
}

/// In-memory source, mostly for tests and embedding
#[derive(Debug, Clone)]
pub struct MemorySourceReader {
    tables: BTreeMap<SourceTable, String>,
    delimiter: u8,
}

impl MemorySourceReader {
    pub fn new() -> Self {
        MemorySourceReader {
            tables: BTreeMap::new(),
            delimiter: b',',
        }
    }

    /// Builder: register CSV text for a table
    pub fn with_table(mut self, table: SourceTable, csv_text: &str) -> Self {
        self.tables.insert(table, csv_text.to_string());
        self
    }
}

impl Default for MemorySourceReader {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceReader for MemorySourceReader {
    fn read_table(&self, table: SourceTable) -> Result<RawTable, SourceError> {
        let path = PathBuf::from(format!("memory://{}", table.file_stem()));
        let text = self.tables.get(&table).ok_or_else(|| SourceError::NotFound {
            table: table.name().to_string(),
            path: path.clone(),
        })?;

        let raw = RawTable::parse(table, text, self.delimiter)
            .map_err(|source| SourceError::Corrupt { path, source })?;
        raw.check_schema()?;
        Ok(raw)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_keeps_line_numbers() {
        let raw = RawTable::parse(
            SourceTable::Branches,
            "cod_agencia,nome,uf\n1,Agencia Centro,SP\n2,Agencia Sul,RS\n",
            b',',
        )
        .unwrap();

        assert_eq!(raw.len(), 2);
        assert_eq!(raw.rows[0].line, 2);
        assert_eq!(raw.rows[1].line, 3);
        assert_eq!(raw.column_index("uf"), Some(2));
        assert!(raw.check_schema().is_ok());
    }

    #[test]
    fn test_schema_mismatch() {
        let raw = RawTable::parse(SourceTable::Branches, "cod_agencia,nome\n1,Centro\n", b',')
            .unwrap();

        match raw.check_schema() {
            Err(SourceError::SchemaMismatch { table, column }) => {
                assert_eq!(table, "branches");
                assert_eq!(column, "uf");
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_directory_reader_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let reader = CsvDirectoryReader::new(dir.path(), b',');

        let err = reader.read_table(SourceTable::Accounts).unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
        assert!(err.to_string().contains("contas.csv"));
    }

    #[test]
    fn test_directory_reader_latin1_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agencias.csv");
        let mut file = fs::File::create(&path).unwrap();
        // "São Paulo" encoded as Latin-1
        file.write_all(b"cod_agencia,nome,uf\n1,Ag\xeancia,S\xe3o Paulo\n").unwrap();
        drop(file);

        let reader = CsvDirectoryReader::new(dir.path(), b',');
        let raw = reader.read_table(SourceTable::Branches).unwrap();

        assert_eq!(raw.rows[0].record.get(1), Some("Agência"));
        assert_eq!(raw.rows[0].record.get(2), Some("São Paulo"));
    }

    #[test]
    fn test_directory_reader_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("agencias.csv"),
            "cod_agencia,nome,uf\n1,Centro\n",
        )
        .unwrap();

        let reader = CsvDirectoryReader::new(dir.path(), b',');
        let err = reader.read_table(SourceTable::Branches).unwrap_err();
        assert!(matches!(err, SourceError::Corrupt { .. }));
    }

    #[test]
    fn test_memory_reader_custom_table() {
        let reader = MemorySourceReader::new()
            .with_table(SourceTable::BranchEmployeeLinks, "cod_colaborador,cod_agencia\n7,1\n");

        let raw = reader.read_table(SourceTable::BranchEmployeeLinks).unwrap();
        assert_eq!(raw.len(), 1);
        assert!(reader.read_table(SourceTable::Clients).is_err());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(SourceTable::CreditProposals.name(), "credit_proposals");
        assert_eq!(SourceTable::CreditProposals.file_stem(), "propostas_credito");
        assert_eq!(SourceTable::ALL.len(), 7);
    }
}
