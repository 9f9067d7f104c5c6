// 🧮 Derivation Engine - computed fields on joined transactions
//
// Derived values only ever land in new columns; source columns are copied
// through untouched. Aggregates are computed over the joined set, so the
// output is identical regardless of input order.

use crate::checkpoint::TableRow;
use crate::config::{AgeBounds, TransformConfig};
use crate::join::JoinedTransaction;
use crate::normalizer::RegionCodeMap;
use crate::report::{Diagnostic, ReasonCode, Stage};
use crate::rules::CategoryEngine;
use crate::source::SourceTable;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Stand-in divisor for zero balances in `valor_vs_saldo`
pub const ZERO_BALANCE_EPSILON: f64 = 1e-6;

// ============================================================================
// DATE ARITHMETIC
// ============================================================================

/// Whole years between two dates, floored (birthday not yet reached = one less)
pub fn age_in_years(birth: NaiveDate, at: NaiveDate) -> i32 {
    let mut years = at.year() - birth.year();
    if (at.month(), at.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    years
}

/// Whole months between two dates, floored
pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let mut months =
        (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    if end.day() < start.day() {
        months -= 1;
    }
    months
}

/// Age flag, if the value falls outside the configured bounds
pub fn age_flag(age: i32, bounds: &AgeBounds) -> Option<ReasonCode> {
    if age < 0 {
        Some(ReasonCode::NegativeAge)
    } else if age < bounds.min || age > bounds.max {
        Some(ReasonCode::AgeOutOfBounds)
    } else {
        None
    }
}

// ============================================================================
// ENRICHED TRANSACTION
// ============================================================================

/// One row of `transacoes_tratado`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedTransaction {
    // --- source transaction ---
    pub cod_transacao: i64,
    pub num_conta: i64,
    pub data_transacao: NaiveDateTime,
    pub nome_transacao: String,
    pub valor_transacao: f64,
    pub categoria: Option<String>,

    // --- account ---
    pub tipo_conta: String,
    pub data_abertura_conta: NaiveDateTime,
    pub saldo_disponivel: Option<f64>,
    pub cod_colaborador: Option<i64>,
    pub cod_agencia_colaborador: Option<i64>,

    // --- client ---
    pub cod_cliente: Option<i64>,
    pub nome_cliente: Option<String>,
    pub tipo_cliente: Option<String>,
    pub data_nascimento_cliente: Option<NaiveDate>,
    pub uf_cliente: Option<String>,

    // --- branch ---
    pub cod_agencia: Option<i64>,
    pub nome_agencia: Option<String>,
    pub cidade_agencia: Option<String>,
    pub uf_agencia: Option<String>,

    // --- derived ---
    pub idade_cliente: Option<i32>,
    pub idade_alerta: Option<ReasonCode>,
    pub tempo_conta_meses: i32,
    pub uf_cliente_normalizada: Option<String>,
    pub uf_agencia_normalizada: Option<String>,
    pub uf_agencia_nome: Option<String>,
    pub categoria_derivada: String,
    pub direcao: String,
    pub mes_ano: String,
    pub valor_transacao_limitado: f64,
    pub valor_medio_conta: f64,
    pub freq_transacoes: usize,
    pub valor_vs_saldo: Option<f64>,
    pub valor_evolucao_mes: f64,

    #[serde(skip)]
    pub line: u64,
}

impl TableRow for EnrichedTransaction {
    const COLUMNS: &'static [&'static str] = &[
        "cod_transacao",
        "num_conta",
        "data_transacao",
        "nome_transacao",
        "valor_transacao",
        "categoria",
        "tipo_conta",
        "data_abertura_conta",
        "saldo_disponivel",
        "cod_colaborador",
        "cod_agencia_colaborador",
        "cod_cliente",
        "nome_cliente",
        "tipo_cliente",
        "data_nascimento_cliente",
        "uf_cliente",
        "cod_agencia",
        "nome_agencia",
        "cidade_agencia",
        "uf_agencia",
        "idade_cliente",
        "idade_alerta",
        "tempo_conta_meses",
        "uf_cliente_normalizada",
        "uf_agencia_normalizada",
        "uf_agencia_nome",
        "categoria_derivada",
        "direcao",
        "mes_ano",
        "valor_transacao_limitado",
        "valor_medio_conta",
        "freq_transacoes",
        "valor_vs_saldo",
        "valor_evolucao_mes",
    ];
}

// ============================================================================
// AGGREGATES
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct AccountStats {
    total: f64,
    count: usize,
}

impl AccountStats {
    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct Aggregates {
    per_account: BTreeMap<i64, AccountStats>,
    per_month: BTreeMap<String, f64>,
}

impl Aggregates {
    fn collect(rows: &[JoinedTransaction], clip: f64) -> Self {
        let mut aggregates = Aggregates::default();
        for row in rows {
            let stats = aggregates
                .per_account
                .entry(row.transaction.account_id)
                .or_default();
            stats.total += row.transaction.amount;
            stats.count += 1;

            *aggregates
                .per_month
                .entry(month_key(row.transaction.timestamp))
                .or_insert(0.0) += clip_amount(row.transaction.amount, clip);
        }
        aggregates
    }
}

fn month_key(timestamp: NaiveDateTime) -> String {
    timestamp.format("%Y-%m").to_string()
}

fn clip_amount(amount: f64, clip: f64) -> f64 {
    amount.clamp(-clip, clip)
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct DerivationEngine {
    regions: RegionCodeMap,
    region_names: BTreeMap<String, String>,
    categories: CategoryEngine,
    age_bounds: AgeBounds,
    amount_clip: f64,
}

impl DerivationEngine {
    pub fn new(config: &TransformConfig) -> Self {
        DerivationEngine {
            regions: RegionCodeMap::new(&config.region_code_map),
            region_names: config.region_names.clone(),
            categories: CategoryEngine::from_rules(config.category_rules.clone()),
            age_bounds: config.age_bounds,
            amount_clip: config.amount_clip,
        }
    }

    pub fn categories(&self) -> &CategoryEngine {
        &self.categories
    }

    /// Derive every row; age anomalies are flagged, never dropped
    pub fn derive(&self, rows: Vec<JoinedTransaction>) -> (Vec<EnrichedTransaction>, Vec<Diagnostic>) {
        let aggregates = Aggregates::collect(&rows, self.amount_clip);
        let mut flags = Vec::new();

        let enriched: Vec<_> = rows
            .into_iter()
            .map(|row| {
                let enriched = self.derive_row(row, &aggregates);
                if let (Some(reason), Some(age)) = (enriched.idade_alerta, enriched.idade_cliente) {
                    flags.push(
                        Diagnostic::flagged(
                            Stage::Derive,
                            SourceTable::Transactions,
                            enriched.line,
                            reason,
                            format!("idade_cliente = {}", age),
                        )
                        .with_key(enriched.cod_transacao),
                    );
                }
                enriched
            })
            .collect();

        info!(rows = enriched.len(), flagged = flags.len(), "derivation complete");
        (enriched, flags)
    }

    fn derive_row(&self, row: JoinedTransaction, aggregates: &Aggregates) -> EnrichedTransaction {
        let JoinedTransaction {
            transaction,
            account,
            client,
            branch,
            employee_branch_id,
        } = row;

        let date = transaction.timestamp.date();
        let age = client
            .as_ref()
            .and_then(|c| c.birth_date)
            .map(|birth| age_in_years(birth, date));
        let stats = aggregates
            .per_account
            .get(&transaction.account_id)
            .copied()
            .unwrap_or_default();
        let month = month_key(transaction.timestamp);
        let uf_agencia_normalizada = branch
            .as_ref()
            .map(|b| self.regions.lookup(&b.region).code().to_string());

        EnrichedTransaction {
            cod_transacao: transaction.id,
            num_conta: transaction.account_id,
            data_transacao: transaction.timestamp,
            valor_transacao: transaction.amount,

            tipo_conta: account.account_type.clone(),
            data_abertura_conta: account.opened_at,
            saldo_disponivel: account.available_balance,
            cod_colaborador: account.employee_id,
            cod_agencia_colaborador: employee_branch_id,

            cod_cliente: client.as_ref().map(|c| c.id),
            nome_cliente: client.as_ref().map(|c| c.full_name()),
            tipo_cliente: client.as_ref().and_then(|c| c.client_type.clone()),
            data_nascimento_cliente: client.as_ref().and_then(|c| c.birth_date),
            uf_cliente_normalizada: client
                .as_ref()
                .and_then(|c| c.region.as_deref())
                .map(|r| self.regions.lookup(r).code().to_string()),
            uf_cliente: client.and_then(|c| c.region),

            cod_agencia: branch.as_ref().map(|b| b.id),
            nome_agencia: branch.as_ref().map(|b| b.name.clone()),
            cidade_agencia: branch.as_ref().and_then(|b| b.city.clone()),
            uf_agencia: branch.map(|b| b.region),

            idade_cliente: age,
            idade_alerta: age.and_then(|a| age_flag(a, &self.age_bounds)),
            tempo_conta_meses: months_between(account.opened_on(), date),
            uf_agencia_nome: uf_agencia_normalizada
                .as_ref()
                .and_then(|code| self.region_names.get(code).cloned()),
            uf_agencia_normalizada,
            categoria_derivada: self.categories.classify(&transaction.description).to_string(),
            direcao: if transaction.amount >= 0.0 { "entrada" } else { "saida" }.to_string(),
            valor_transacao_limitado: clip_amount(transaction.amount, self.amount_clip),
            valor_medio_conta: stats.mean(),
            freq_transacoes: stats.count,
            valor_vs_saldo: account.available_balance.map(|balance| {
                let divisor = if balance == 0.0 { ZERO_BALANCE_EPSILON } else { balance };
                transaction.amount.abs() / divisor
            }),
            valor_evolucao_mes: aggregates.per_month.get(&month).copied().unwrap_or(0.0),
            mes_ano: month,

            nome_transacao: transaction.description,
            categoria: transaction.category,
            line: transaction.line,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::tests::{account, branch, client, transaction, ts};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn joined(id: i64, account_id: i64, amount: f64) -> JoinedTransaction {
        JoinedTransaction {
            transaction: transaction(id, account_id, amount),
            account: account(account_id, Some(1), Some(1)),
            client: Some(client(1)),
            branch: Some(branch(1)),
            employee_branch_id: None,
        }
    }

    #[test]
    fn test_age_is_floored_on_birthday_boundary() {
        let birth = date(1990, 1, 15);
        assert_eq!(age_in_years(birth, date(2020, 1, 14)), 29);
        assert_eq!(age_in_years(birth, date(2020, 1, 15)), 30);
        assert_eq!(age_in_years(birth, date(1989, 6, 1)), -1);
    }

    #[test]
    fn test_months_between() {
        assert_eq!(months_between(date(2015, 3, 10), date(2020, 1, 14)), 58);
        assert_eq!(months_between(date(2020, 1, 15), date(2020, 2, 14)), 0);
        assert_eq!(months_between(date(2020, 1, 15), date(2020, 2, 15)), 1);
    }

    #[test]
    fn test_age_flags() {
        let bounds = AgeBounds::default();
        assert_eq!(age_flag(-2, &bounds), Some(ReasonCode::NegativeAge));
        assert_eq!(age_flag(131, &bounds), Some(ReasonCode::AgeOutOfBounds));
        assert_eq!(age_flag(40, &bounds), None);
    }

    #[test]
    fn test_derive_row_fields() {
        let engine = DerivationEngine::new(&TransformConfig::default());
        let (rows, flags) = engine.derive(vec![
            joined(1, 10, 100.0),
            joined(2, 10, -50.0),
            joined(3, 11, 2_000_000.0),
        ]);

        assert!(flags.is_empty());
        let first = &rows[0];
        assert_eq!(first.idade_cliente, Some(29));
        assert_eq!(first.mes_ano, "2020-01");
        assert_eq!(first.categoria_derivada, "pix");
        assert_eq!(first.direcao, "entrada");
        assert_eq!(rows[1].direcao, "saida");
        assert_eq!(first.freq_transacoes, 2);
        assert_eq!(first.valor_medio_conta, 25.0);
        assert_eq!(first.valor_vs_saldo, Some(100.0 / 800.0));
        assert_eq!(first.uf_agencia_nome.as_deref(), Some("São Paulo"));
        assert_eq!(rows[2].valor_transacao_limitado, 1_000_000.0);
        assert_eq!(first.valor_evolucao_mes, 100.0 - 50.0 + 1_000_000.0);
        // source fields pass through unchanged
        assert_eq!(first.valor_transacao, 100.0);
        assert_eq!(first.data_transacao, ts("2020-01-14 10:30:00"));
    }

    #[test]
    fn test_zero_balance_uses_epsilon() {
        let engine = DerivationEngine::new(&TransformConfig::default());
        let mut row = joined(1, 10, 1.0);
        row.account.available_balance = Some(0.0);

        let (rows, _) = engine.derive(vec![row]);
        assert_eq!(rows[0].valor_vs_saldo, Some(1.0 / ZERO_BALANCE_EPSILON));
    }

    #[test]
    fn test_future_birth_relative_to_transaction_is_flagged() {
        let engine = DerivationEngine::new(&TransformConfig::default());
        let mut row = joined(1, 10, 1.0);
        if let Some(client) = row.client.as_mut() {
            client.birth_date = Some(date(2021, 5, 1));
        }

        let (rows, flags) = engine.derive(vec![row]);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].idade_alerta, Some(ReasonCode::NegativeAge));
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].reason, ReasonCode::NegativeAge);
    }

    #[test]
    fn test_derivation_is_order_independent() {
        let engine = DerivationEngine::new(&TransformConfig::default());
        let forward = engine.derive(vec![joined(1, 10, 3.0), joined(2, 10, 4.0)]).0;
        let backward = engine.derive(vec![joined(2, 10, 4.0), joined(1, 10, 3.0)]).0;

        assert_eq!(forward[0], backward[1]);
        assert_eq!(forward[1], backward[0]);
    }
}
