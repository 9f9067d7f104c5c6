// Bank ETL - Transform Core Library
// Exposes the transform stages and their collaborators for the CLI and tests

pub mod error;
pub mod config;
pub mod source;         // Source Reader: raw delimited tables
pub mod normalizer;     // Field Normalizer: per-column canonical forms
pub mod entities;       // Typed records per source table
pub mod join;           // Entity Joiner: keyed indexes + assignments
pub mod rules;          // Category rules for transaction descriptions
pub mod derive;         // Derivation Engine
pub mod quality;        // Quality Gate
pub mod outputs;        // Treated per-entity tables
pub mod report;         // Diagnostics + run report
pub mod checkpoint;     // Checkpoint Store: SQLite snapshots
pub mod sink;           // Sink Writer: staged CSV publishing
pub mod pipeline;

// Re-export commonly used types
pub use error::{CheckpointError, PipelineError, Result, SinkError, SourceError};
pub use config::{
    AgeBounds, JoinPolicy, JoinType, OutputEncoding, SinkOptions, SourceOptions, TransformConfig,
};
pub use source::{
    read_all, CsvDirectoryReader, MemorySourceReader, RawRow, RawTable, SourceReader, SourceSet,
    SourceTable,
};
pub use normalizer::{ColumnRule, DateParser, FieldNormalizer, RegionCodeMap, RegionLookup};
pub use entities::{
    Account, Branch, BranchEmployeeLink, Client, CreditProposal, Employee, Keyed, Record,
    Transaction,
};
pub use join::{
    resolve_assignments, BranchAssignment, EntityJoiner, JoinOutput, JoinedTransaction,
    KeyedIndex, RejectedTransaction,
};
pub use rules::{CategoryEngine, CategoryRule};
pub use derive::{DerivationEngine, EnrichedTransaction};
pub use quality::{QualityGate, QualityReport, ValidationResult};
pub use report::{Diagnostic, ReasonCode, Severity, Stage, StageCounts, TransformReport};
pub use checkpoint::{
    CheckpointEntry, CheckpointStore, MemoryCheckpointStore, Snapshot, SqliteCheckpointStore,
    TableRow,
};
pub use sink::CsvSink;
pub use pipeline::{TransformOutput, TransformPipeline, OUTPUT_TABLES};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
