// 🔗 Entity Joiner - resolves every transaction against its account, client and branch
//
// Join path:
//   Transaction → Account        (always inner: no account, no transaction)
//   Account     → Client         (inner | left, per JoinPolicy)
//   Account     → Branch         (inner | left, per JoinPolicy)
//   Account     → Employee → Branch assignment (informational, never rejects)
//
// Indexes are keyed maps. A key that appears twice on the "one" side of a
// join is fatal: fan-out would silently duplicate transactions.

use crate::checkpoint::TableRow;
use crate::config::{JoinPolicy, JoinType};
use crate::entities::{Account, Branch, BranchEmployeeLink, Client, Keyed, Record, Transaction};
use crate::error::{PipelineError, Result};
use crate::report::{Diagnostic, ReasonCode, Stage};
use crate::source::SourceTable;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

// ============================================================================
// KEYED INDEX
// ============================================================================

/// Unique-key lookup over a borrowed record set
#[derive(Debug)]
pub struct KeyedIndex<'a, T> {
    table: SourceTable,
    entries: BTreeMap<i64, &'a T>,
}

impl<'a, T: Keyed + Record> KeyedIndex<'a, T> {
    /// Build the index; any repeated key aborts with `DuplicateKey`
    pub fn build(records: &'a [T]) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for record in records {
            if entries.insert(record.key(), record).is_some() {
                let key = record.key();
                let count = records.iter().filter(|r| r.key() == key).count();
                return Err(PipelineError::DuplicateKey {
                    table: T::TABLE.name().to_string(),
                    key: key.to_string(),
                    count,
                });
            }
        }

        debug!(table = %T::TABLE, keys = entries.len(), "index built");
        Ok(KeyedIndex {
            table: T::TABLE,
            entries,
        })
    }

    pub fn get(&self, key: i64) -> Option<&'a T> {
        self.entries.get(&key).copied()
    }

    pub fn table(&self) -> SourceTable {
        self.table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fail the run when a join step loses or invents rows
pub fn ensure_cardinality(stage: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(PipelineError::CardinalityMismatch {
            stage: stage.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

// ============================================================================
// EMPLOYEE → BRANCH ASSIGNMENT
// ============================================================================

/// The single branch an employee is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchAssignment {
    pub employee_id: i64,
    pub branch_id: i64,
    pub effective_from: Option<NaiveDate>,
}

impl BranchAssignment {
    fn from_link(link: &BranchEmployeeLink) -> Self {
        BranchAssignment {
            employee_id: link.employee_id,
            branch_id: link.branch_id,
            effective_from: link.effective_from,
        }
    }

    /// Latest effective date wins (undated is oldest), then lowest employee id,
    /// then lowest branch id
    fn outranks(&self, other: &BranchAssignment) -> bool {
        (
            self.effective_from,
            std::cmp::Reverse(self.employee_id),
            std::cmp::Reverse(self.branch_id),
        ) > (
            other.effective_from,
            std::cmp::Reverse(other.employee_id),
            std::cmp::Reverse(other.branch_id),
        )
    }
}

/// Collapse many-to-many links into one assignment per employee
pub fn resolve_assignments(links: &[BranchEmployeeLink]) -> BTreeMap<i64, BranchAssignment> {
    let mut assignments: BTreeMap<i64, BranchAssignment> = BTreeMap::new();

    for link in links {
        let candidate = BranchAssignment::from_link(link);
        match assignments.get(&link.employee_id) {
            Some(current) if !candidate.outranks(current) => {}
            _ => {
                assignments.insert(link.employee_id, candidate);
            }
        }
    }

    assignments
}

// ============================================================================
// JOINED ROWS
// ============================================================================

/// A transaction with its resolved references, before derivation
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedTransaction {
    pub transaction: Transaction,
    pub account: Account,
    /// None when the account has no client, or a dangling one under a left join
    pub client: Option<Client>,
    pub branch: Option<Branch>,
    /// Branch the servicing employee is assigned to
    pub employee_branch_id: Option<i64>,
}

/// A transaction that did not make it into the accepted set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedTransaction {
    #[serde(rename = "linha")]
    pub line: u64,

    #[serde(rename = "cod_transacao")]
    pub id: Option<String>,

    #[serde(rename = "num_conta")]
    pub account_id: Option<String>,

    #[serde(rename = "valor_transacao")]
    pub amount: Option<f64>,

    #[serde(rename = "etapa")]
    pub stage: Stage,

    #[serde(rename = "motivo")]
    pub reason: ReasonCode,

    #[serde(rename = "detalhe")]
    pub detail: String,
}

impl TableRow for RejectedTransaction {
    const COLUMNS: &'static [&'static str] = &[
        "linha",
        "cod_transacao",
        "num_conta",
        "valor_transacao",
        "etapa",
        "motivo",
        "detalhe",
    ];
}

impl RejectedTransaction {
    pub fn from_transaction(
        transaction: &Transaction,
        stage: Stage,
        reason: ReasonCode,
        detail: impl Into<String>,
    ) -> Self {
        RejectedTransaction {
            line: transaction.line,
            id: Some(transaction.id.to_string()),
            account_id: Some(transaction.account_id.to_string()),
            amount: Some(transaction.amount),
            stage,
            reason,
            detail: detail.into(),
        }
    }

    /// Rows excluded before they were typed only keep what the diagnostic knows
    pub fn from_diagnostic(diagnostic: &Diagnostic) -> Self {
        RejectedTransaction {
            line: diagnostic.line,
            id: diagnostic.key.clone(),
            account_id: None,
            amount: None,
            stage: diagnostic.stage,
            reason: diagnostic.reason,
            detail: diagnostic.detail.clone(),
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        let diagnostic = Diagnostic::excluded(
            self.stage,
            SourceTable::Transactions,
            self.line,
            self.reason,
            self.detail.clone(),
        );
        match &self.id {
            Some(id) => diagnostic.with_key(id),
            None => diagnostic,
        }
    }
}

#[derive(Debug, Default)]
pub struct JoinOutput {
    pub joined: Vec<JoinedTransaction>,
    pub rejected: Vec<RejectedTransaction>,
    /// Warnings for rows kept under a left join
    pub flags: Vec<Diagnostic>,
}

// ============================================================================
// JOINER
// ============================================================================

pub struct EntityJoiner<'a> {
    policy: JoinPolicy,
    accounts: KeyedIndex<'a, Account>,
    clients: KeyedIndex<'a, Client>,
    branches: KeyedIndex<'a, Branch>,
    assignments: &'a BTreeMap<i64, BranchAssignment>,
}

impl<'a> EntityJoiner<'a> {
    pub fn new(
        policy: JoinPolicy,
        accounts: &'a [Account],
        clients: &'a [Client],
        branches: &'a [Branch],
        assignments: &'a BTreeMap<i64, BranchAssignment>,
    ) -> Result<Self> {
        Ok(EntityJoiner {
            policy,
            accounts: KeyedIndex::build(accounts)?,
            clients: KeyedIndex::build(clients)?,
            branches: KeyedIndex::build(branches)?,
            assignments,
        })
    }

    pub fn branches(&self) -> &KeyedIndex<'a, Branch> {
        &self.branches
    }

    /// Join every transaction; each input row ends up joined or rejected exactly once
    pub fn join(&self, transactions: Vec<Transaction>) -> Result<JoinOutput> {
        KeyedIndex::build(&transactions)?;

        let input = transactions.len();
        let mut output = JoinOutput::default();

        let with_accounts = self.join_accounts(transactions, &mut output);
        ensure_cardinality(
            "join/account",
            input,
            with_accounts.len() + output.rejected.len(),
        )?;

        let before = output.rejected.len();
        let step_input = with_accounts.len();
        let with_clients = self.join_clients(with_accounts, &mut output);
        ensure_cardinality(
            "join/client",
            step_input,
            with_clients.len() + output.rejected.len() - before,
        )?;

        let before = output.rejected.len();
        let step_input = with_clients.len();
        output.joined = self.join_branches(with_clients, &mut output);
        ensure_cardinality(
            "join/branch",
            step_input,
            output.joined.len() + output.rejected.len() - before,
        )?;

        info!(
            input,
            joined = output.joined.len(),
            rejected = output.rejected.len(),
            flagged = output.flags.len(),
            "transactions joined"
        );
        Ok(output)
    }

    fn join_accounts(
        &self,
        transactions: Vec<Transaction>,
        output: &mut JoinOutput,
    ) -> Vec<JoinedTransaction> {
        let mut joined = Vec::with_capacity(transactions.len());

        for transaction in transactions {
            match self.accounts.get(transaction.account_id) {
                Some(account) => joined.push(JoinedTransaction {
                    employee_branch_id: account
                        .employee_id
                        .and_then(|id| self.assignments.get(&id))
                        .map(|a| a.branch_id),
                    account: account.clone(),
                    client: None,
                    branch: None,
                    transaction,
                }),
                None => {
                    let detail = format!("num_conta {} not found", transaction.account_id);
                    output.rejected.push(RejectedTransaction::from_transaction(
                        &transaction,
                        Stage::Join,
                        ReasonCode::UnresolvedAccount,
                        detail,
                    ));
                }
            }
        }

        joined
    }

    fn join_clients(
        &self,
        rows: Vec<JoinedTransaction>,
        output: &mut JoinOutput,
    ) -> Vec<JoinedTransaction> {
        let mut joined = Vec::with_capacity(rows.len());

        for mut row in rows {
            let client_id = row.account.client_id;
            row.client = client_id.and_then(|id| self.clients.get(id)).cloned();

            if row.client.is_some() {
                joined.push(row);
                continue;
            }

            let detail = match client_id {
                Some(id) => format!("cod_cliente {} not found", id),
                None => "account has no cod_cliente".to_string(),
            };

            match self.policy.account_client {
                JoinType::Inner => output.rejected.push(RejectedTransaction::from_transaction(
                    &row.transaction,
                    Stage::Join,
                    ReasonCode::UnresolvedClient,
                    detail,
                )),
                JoinType::Left => {
                    // Dangling reference is cleared, not carried forward
                    if client_id.is_some() {
                        row.account.client_id = None;
                        output.flags.push(
                            Diagnostic::flagged(
                                Stage::Join,
                                SourceTable::Transactions,
                                row.transaction.line,
                                ReasonCode::UnresolvedClient,
                                detail,
                            )
                            .with_key(row.transaction.id),
                        );
                    }
                    joined.push(row);
                }
            }
        }

        joined
    }

    fn join_branches(
        &self,
        rows: Vec<JoinedTransaction>,
        output: &mut JoinOutput,
    ) -> Vec<JoinedTransaction> {
        let mut joined = Vec::with_capacity(rows.len());

        for mut row in rows {
            let branch_id = row.account.branch_id;
            row.branch = branch_id.and_then(|id| self.branches.get(id)).cloned();

            if row.branch.is_some() {
                joined.push(row);
                continue;
            }

            let detail = match branch_id {
                Some(id) => format!("cod_agencia {} not found", id),
                None => "account has no cod_agencia".to_string(),
            };

            match self.policy.account_branch {
                JoinType::Inner => output.rejected.push(RejectedTransaction::from_transaction(
                    &row.transaction,
                    Stage::Join,
                    ReasonCode::UnresolvedBranch,
                    detail,
                )),
                JoinType::Left => {
                    row.account.branch_id = None;
                    output.flags.push(
                        Diagnostic::flagged(
                            Stage::Join,
                            SourceTable::Transactions,
                            row.transaction.line,
                            ReasonCode::UnresolvedBranch,
                            detail,
                        )
                        .with_key(row.transaction.id),
                    );
                    joined.push(row);
                }
            }
        }

        joined
    }
}

// ============================================================================
// TESTS
// ============================================================================
