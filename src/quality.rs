// ✅ Quality Gate - last stop before the sink
//
// Per-record rules split enriched transactions into accepted / rejected.
// Systemic failures (nothing to publish) abort the run instead.

use crate::config::{JoinPolicy, JoinType};
use crate::derive::EnrichedTransaction;
use crate::error::{PipelineError, Result};
use crate::join::RejectedTransaction;
use crate::report::{ReasonCode, Stage};
use crate::source::SourceTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub rule_name: String,
    pub field: String,
    pub reason: Option<ReasonCode>,
    pub message: String,
}

impl ValidationResult {
    pub fn pass(rule_name: &str, field: &str) -> Self {
        ValidationResult {
            passed: true,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            reason: None,
            message: String::new(),
        }
    }

    pub fn fail(rule_name: &str, field: &str, reason: ReasonCode, message: &str) -> Self {
        ValidationResult {
            passed: false,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            reason: Some(reason),
            message: message.to_string(),
        }
    }

    fn check(passed: bool, rule_name: &str, field: &str, reason: ReasonCode, message: &str) -> Self {
        if passed {
            ValidationResult::pass(rule_name, field)
        } else {
            ValidationResult::fail(rule_name, field, reason, message)
        }
    }
}

// ============================================================================
// QUALITY REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub rejected_by_reason: BTreeMap<ReasonCode, usize>,
}

impl QualityReport {
    pub fn acceptance_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.accepted as f64 / self.total as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} transactions: {:.1}% accepted | {} accepted, {} rejected",
            self.total,
            self.acceptance_rate() * 100.0,
            self.accepted,
            self.rejected
        )
    }
}

#[derive(Debug, Default)]
pub struct GateOutcome {
    pub accepted: Vec<EnrichedTransaction>,
    pub rejected: Vec<RejectedTransaction>,
    pub report: QualityReport,
}

// ============================================================================
// QUALITY GATE
// ============================================================================

pub struct QualityGate {
    policy: JoinPolicy,
}

impl QualityGate {
    pub fn new(policy: JoinPolicy) -> Self {
        QualityGate { policy }
    }

    /// Run every rule against one row
    pub fn validate(&self, tx: &EnrichedTransaction) -> Vec<ValidationResult> {
        let mut results = Vec::new();

        // Rule 1: Referential completeness
        results.push(ValidationResult::check(
            tx.cod_agencia.is_some() && tx.nome_agencia.is_some(),
            "branch_resolved",
            "cod_agencia",
            ReasonCode::UnresolvedBranch,
            "transaction has no resolved branch",
        ));
        let client_required = self.policy.account_client == JoinType::Inner;
        results.push(ValidationResult::check(
            tx.nome_cliente.is_some() || (!client_required && tx.cod_cliente.is_none()),
            "client_resolved",
            "cod_cliente",
            ReasonCode::UnresolvedClient,
            "transaction has no resolved client",
        ));

        // Rule 2: Required non-null fields
        results.push(ValidationResult::check(
            !tx.nome_transacao.trim().is_empty(),
            "description_present",
            "nome_transacao",
            ReasonCode::MissingRequiredField,
            "nome_transacao is empty",
        ));
        results.push(ValidationResult::check(
            !tx.tipo_conta.trim().is_empty(),
            "account_type_present",
            "tipo_conta",
            ReasonCode::MissingRequiredField,
            "tipo_conta is empty",
        ));
        results.push(ValidationResult::check(
            tx.nome_agencia.as_deref().map(|n| !n.trim().is_empty()).unwrap_or(true),
            "branch_name_present",
            "nome_agencia",
            ReasonCode::MissingRequiredField,
            "nome_agencia is empty",
        ));

        // Rule 3: Type conformance of derived values
        let numbers_finite = tx.valor_transacao.is_finite()
            && tx.valor_transacao_limitado.is_finite()
            && tx.valor_medio_conta.is_finite()
            && tx.valor_evolucao_mes.is_finite()
            && tx.valor_vs_saldo.map(f64::is_finite).unwrap_or(true);
        results.push(ValidationResult::check(
            numbers_finite,
            "numbers_finite",
            "valor_transacao",
            ReasonCode::InvalidType,
            "numeric field is not finite",
        ));
        results.push(ValidationResult::check(
            tx.mes_ano == tx.data_transacao.format("%Y-%m").to_string(),
            "month_consistent",
            "mes_ano",
            ReasonCode::InvalidType,
            "mes_ano does not match data_transacao",
        ));
        results.push(ValidationResult::check(
            tx.data_nascimento_cliente.is_none() || tx.idade_cliente.is_some(),
            "age_derived",
            "idade_cliente",
            ReasonCode::InvalidType,
            "birth date present but age missing",
        ));

        results
    }

    /// Partition rows; the first failing rule decides the rejection reason
    pub fn apply(&self, rows: Vec<EnrichedTransaction>) -> GateOutcome {
        let mut outcome = GateOutcome::default();
        outcome.report.total = rows.len();

        for tx in rows {
            let failure = self.validate(&tx).into_iter().find(|r| !r.passed);
            match failure {
                None => outcome.accepted.push(tx),
                Some(result) => {
                    let reason = result.reason.unwrap_or(ReasonCode::InvalidType);
                    *outcome.report.rejected_by_reason.entry(reason).or_insert(0) += 1;
                    outcome.rejected.push(RejectedTransaction {
                        line: tx.line,
                        id: Some(tx.cod_transacao.to_string()),
                        account_id: Some(tx.num_conta.to_string()),
                        amount: Some(tx.valor_transacao),
                        stage: Stage::QualityGate,
                        reason,
                        detail: format!("{}: {}", result.rule_name, result.message),
                    });
                }
            }
        }

        outcome.report.accepted = outcome.accepted.len();
        outcome.report.rejected = outcome.rejected.len();
        info!("{}", outcome.report.summary());
        outcome
    }
}

/// Systemic check over the whole transaction ledger
pub fn ensure_publishable(source_rows: usize, accepted: usize) -> Result<()> {
    if source_rows == 0 {
        return Err(PipelineError::EmptySource(
            SourceTable::Transactions.name().to_string(),
        ));
    }
    if accepted == 0 {
        warn!(source_rows, "every transaction was rejected");
        return Err(PipelineError::TotalRejection {
            table: SourceTable::Transactions.name().to_string(),
            count: source_rows,
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::derive::DerivationEngine;
    use crate::join::tests::{account, branch, client, transaction};
    use crate::join::JoinedTransaction;

    fn enriched(with_branch: bool) -> EnrichedTransaction {
        let engine = DerivationEngine::new(&TransformConfig::default());
        let row = JoinedTransaction {
            transaction: transaction(1, 10, 42.0),
            account: account(10, Some(1), Some(1)),
            client: Some(client(1)),
            branch: if with_branch { Some(branch(1)) } else { None },
            employee_branch_id: None,
        };
        engine.derive(vec![row]).0.remove(0)
    }

    #[test]
    fn test_valid_row_passes_all_rules() {
        let gate = QualityGate::new(JoinPolicy::default());
        let results = gate.validate(&enriched(true));
        assert!(results.iter().all(|r| r.passed), "{:?}", results);
    }

    #[test]
    fn test_missing_branch_rejected() {
        let gate = QualityGate::new(JoinPolicy::default());
        let outcome = gate.apply(vec![enriched(true), enriched(false)]);

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].reason, ReasonCode::UnresolvedBranch);
        assert_eq!(outcome.rejected[0].stage, Stage::QualityGate);
        assert_eq!(outcome.report.rejected_by_reason[&ReasonCode::UnresolvedBranch], 1);
        assert_eq!(outcome.report.acceptance_rate(), 0.5);
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let gate = QualityGate::new(JoinPolicy::default());
        let mut row = enriched(true);
        row.valor_vs_saldo = Some(f64::INFINITY);

        let outcome = gate.apply(vec![row]);
        assert_eq!(outcome.rejected[0].reason, ReasonCode::InvalidType);
    }

    #[test]
    fn test_inner_client_policy_requires_client() {
        let policy = JoinPolicy {
            account_client: JoinType::Inner,
            account_branch: JoinType::Inner,
        };
        let gate = QualityGate::new(policy);
        let mut row = enriched(true);
        row.cod_cliente = None;
        row.nome_cliente = None;

        let outcome = gate.apply(vec![row]);
        assert_eq!(outcome.rejected[0].reason, ReasonCode::UnresolvedClient);
    }

    #[test]
    fn test_systemic_checks() {
        assert!(matches!(ensure_publishable(0, 0), Err(PipelineError::EmptySource(_))));
        assert!(matches!(
            ensure_publishable(5, 0),
            Err(PipelineError::TotalRejection { count: 5, .. })
        ));
        assert!(ensure_publishable(5, 1).is_ok());
    }
}
