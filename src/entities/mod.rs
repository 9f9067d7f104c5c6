// Entity Models - typed records decoded from normalized source tables
//
// Each entity:
// - has a fixed source schema (column names kept via serde rename)
// - is decoded once per run and never mutated afterwards
// - carries its source line for diagnostics

pub mod account;
pub mod branch;
pub mod client;
pub mod employee;
pub mod proposal;
pub mod transaction;

pub use account::Account;
pub use branch::Branch;
pub use client::Client;
pub use employee::{BranchEmployeeLink, Employee};
pub use proposal::CreditProposal;
pub use transaction::Transaction;

use crate::report::{Diagnostic, ReasonCode, Stage};
use crate::source::{RawTable, SourceTable};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;

// ============================================================================
// RECORD TRAITS
// ============================================================================

/// A typed record decoded from one source table
pub trait Record: DeserializeOwned {
    const TABLE: SourceTable;

    fn line(&self) -> u64;
    fn set_line(&mut self, line: u64);

    /// First required value that decoded but is blank
    fn missing_field(&self) -> Option<&'static str> {
        None
    }

    /// Identifier text for diagnostics
    fn record_key(&self) -> Option<String> {
        None
    }

    /// Record-level invariant that depends on the processing date
    fn screen(&self, _processing_date: NaiveDate) -> Option<(ReasonCode, String)> {
        None
    }
}

/// Records with a unique integer identifier
pub trait Keyed {
    fn key(&self) -> i64;
}

// ============================================================================
// DECODING
// ============================================================================

/// Decode a normalized table into typed records; undecodable rows become diagnostics
pub fn decode_table<T: Record>(raw: &RawTable) -> (Vec<T>, Vec<Diagnostic>) {
    let mut records = Vec::with_capacity(raw.rows.len());
    let mut diagnostics = Vec::new();

    for row in &raw.rows {
        match row.record.deserialize::<T>(Some(&raw.headers)) {
            Ok(mut record) => {
                record.set_line(row.line);
                if let Some(field) = record.missing_field() {
                    let mut diagnostic = Diagnostic::excluded(
                        Stage::Decode,
                        T::TABLE,
                        row.line,
                        ReasonCode::MissingRequiredField,
                        format!("{} is empty", field),
                    );
                    diagnostic.key = raw.key_of(row);
                    diagnostics.push(diagnostic);
                    continue;
                }
                records.push(record);
            }
            Err(err) => {
                let mut diagnostic = Diagnostic::excluded(
                    Stage::Decode,
                    T::TABLE,
                    row.line,
                    ReasonCode::MissingRequiredField,
                    err.to_string(),
                );
                diagnostic.key = raw.key_of(row);
                diagnostics.push(diagnostic);
            }
        }
    }

    (records, diagnostics)
}

/// "primeiro_nome ultimo_nome", skipping blanks
pub fn full_name(first: &str, last: Option<&str>) -> String {
    match last.map(str::trim).filter(|l| !l.is_empty()) {
        Some(last) => format!("{} {}", first.trim(), last),
        None => first.trim().to_string(),
    }
}
