// 📋 Diagnostics & run report
// Per-record defects are collected here instead of being raised.

use crate::source::SourceTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// REASON CODES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InvalidDate,
    InvalidNumber,
    MissingRequiredField,
    BirthDateInFuture,
    UnmappedRegionCode,
    UnresolvedAccount,
    UnresolvedClient,
    UnresolvedBranch,
    InvalidType,
    NegativeAge,
    AgeOutOfBounds,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::InvalidDate => "invalid_date",
            ReasonCode::InvalidNumber => "invalid_number",
            ReasonCode::MissingRequiredField => "missing_required_field",
            ReasonCode::BirthDateInFuture => "birth_date_in_future",
            ReasonCode::UnmappedRegionCode => "unmapped_region_code",
            ReasonCode::UnresolvedAccount => "unresolved_account",
            ReasonCode::UnresolvedClient => "unresolved_client",
            ReasonCode::UnresolvedBranch => "unresolved_branch",
            ReasonCode::InvalidType => "invalid_type",
            ReasonCode::NegativeAge => "negative_age",
            ReasonCode::AgeOutOfBounds => "age_out_of_bounds",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Decode,
    Join,
    Derive,
    QualityGate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Decode => "decode",
            Stage::Join => "join",
            Stage::Derive => "derive",
            Stage::QualityGate => "quality_gate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Record excluded or rejected
    Warning,  // Record kept but flagged
}

// ============================================================================
// DIAGNOSTIC
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: Stage,
    pub table: SourceTable,
    /// Line in the source file (0 when unknown)
    pub line: u64,
    pub key: Option<String>,
    pub reason: ReasonCode,
    pub severity: Severity,
    pub detail: String,
}

impl Diagnostic {
    pub fn excluded(
        stage: Stage,
        table: SourceTable,
        line: u64,
        reason: ReasonCode,
        detail: impl Into<String>,
    ) -> Self {
        Diagnostic {
            stage,
            table,
            line,
            key: None,
            reason,
            severity: Severity::Critical,
            detail: detail.into(),
        }
    }

    pub fn flagged(
        stage: Stage,
        table: SourceTable,
        line: u64,
        reason: ReasonCode,
        detail: impl Into<String>,
    ) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::excluded(stage, table, line, reason, detail)
        }
    }

    /// Builder: attach the record key
    pub fn with_key(mut self, key: impl ToString) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn is_exclusion(&self) -> bool {
        self.severity == Severity::Critical
    }
}

// ============================================================================
// STAGE COUNTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub input: usize,
    pub output: usize,
    pub excluded: usize,
    pub flagged: usize,
}

/// Counts plus diagnostics for a whole run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformReport {
    pub run_id: String,
    pub processing_date: String,
    /// "stage/table" → counts
    pub stages: BTreeMap<String, StageCounts>,
    pub rejected_by_reason: BTreeMap<String, usize>,
    pub source_transactions: usize,
    pub accepted_transactions: usize,
    pub rejected_transactions: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl TransformReport {
    pub fn new(run_id: &str, processing_date: &str) -> Self {
        TransformReport {
            run_id: run_id.to_string(),
            processing_date: processing_date.to_string(),
            ..Default::default()
        }
    }

    /// Record counts for one stage of one table; excluded/flagged come from the diagnostics
    pub fn record_stage(
        &mut self,
        stage: Stage,
        table: SourceTable,
        input: usize,
        output: usize,
        diagnostics: &[Diagnostic],
    ) {
        let excluded = diagnostics.iter().filter(|d| d.is_exclusion()).count();
        let flagged = diagnostics.len() - excluded;

        self.stages.insert(
            format!("{}/{}", stage.as_str(), table.name()),
            StageCounts {
                input,
                output,
                excluded,
                flagged,
            },
        );
        self.diagnostics.extend_from_slice(diagnostics);
    }

    pub fn stage(&self, stage: Stage, table: SourceTable) -> Option<&StageCounts> {
        self.stages.get(&format!("{}/{}", stage.as_str(), table.name()))
    }

    pub fn count_reason(&self, reason: ReasonCode) -> usize {
        self.diagnostics.iter().filter(|d| d.reason == reason).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "run {}: {} source transactions, {} accepted, {} rejected, {} diagnostics",
            self.run_id,
            self.source_transactions,
            self.accepted_transactions,
            self.rejected_transactions,
            self.diagnostics.len()
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
