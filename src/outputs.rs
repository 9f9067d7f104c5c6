// 📦 Output Tables - treated per-entity tables published next to the transactions
//
//   agencias_tratado             branch + account/transaction aggregates
//   clientes_tratado             client + age, tenure, labels
//   colaboradores_tratado        employee + resolved branch
//   colaborador_agencia_tratado  every link, active assignment marked
//   contas_tratado               account + type label
//   propostas_credito_tratado    proposal + approval rates and client averages

use crate::checkpoint::TableRow;
use crate::config::TransformConfig;
use crate::derive::{age_flag, age_in_years, months_between, EnrichedTransaction};
use crate::entities::{Account, Branch, BranchEmployeeLink, Client, CreditProposal, Employee};
use crate::join::{BranchAssignment, KeyedIndex};
use crate::report::{Diagnostic, ReasonCode, Stage};
use crate::source::SourceTable;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// ROW TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchRow {
    pub cod_agencia: i64,
    pub nome: String,
    pub endereco: Option<String>,
    pub cidade: Option<String>,
    pub uf: String,
    pub uf_nome: Option<String>,
    pub data_abertura: Option<NaiveDate>,
    pub tipo_agencia: Option<String>,
    pub saldo_medio: Option<f64>,
    pub num_contas: usize,
    pub volume_transacoes: f64,
}

impl TableRow for BranchRow {
    const COLUMNS: &'static [&'static str] = &[
        "cod_agencia",
        "nome",
        "endereco",
        "cidade",
        "uf",
        "uf_nome",
        "data_abertura",
        "tipo_agencia",
        "saldo_medio",
        "num_contas",
        "volume_transacoes",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRow {
    pub cod_cliente: i64,
    pub nome_completo: String,
    pub email: Option<String>,
    pub tipo_cliente: Option<String>,
    pub tipo_cliente_descricao: Option<String>,
    pub data_inclusao: Option<NaiveDateTime>,
    pub cpfcnpj: Option<String>,
    pub data_nascimento: Option<NaiveDate>,
    pub endereco: Option<String>,
    pub cep: Option<String>,
    pub uf: Option<String>,
    pub uf_nome: Option<String>,
    pub idade: Option<i32>,
    pub idade_alerta: Option<ReasonCode>,
    pub tempo_como_cliente_meses: Option<i32>,
}

impl TableRow for ClientRow {
    const COLUMNS: &'static [&'static str] = &[
        "cod_cliente",
        "nome_completo",
        "email",
        "tipo_cliente",
        "tipo_cliente_descricao",
        "data_inclusao",
        "cpfcnpj",
        "data_nascimento",
        "endereco",
        "cep",
        "uf",
        "uf_nome",
        "idade",
        "idade_alerta",
        "tempo_como_cliente_meses",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeRow {
    pub cod_colaborador: i64,
    pub nome_completo: String,
    pub email: Option<String>,
    pub cpf: Option<String>,
    pub data_nascimento: Option<NaiveDate>,
    pub endereco: Option<String>,
    pub cep: Option<String>,
    pub cod_agencia: Option<i64>,
    pub nome_agencia: Option<String>,
}

impl TableRow for EmployeeRow {
    const COLUMNS: &'static [&'static str] = &[
        "cod_colaborador",
        "nome_completo",
        "email",
        "cpf",
        "data_nascimento",
        "endereco",
        "cep",
        "cod_agencia",
        "nome_agencia",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkRow {
    pub cod_colaborador: i64,
    pub cod_agencia: i64,
    pub data_inicio: Option<NaiveDate>,
    pub ativo: bool,
}

impl TableRow for LinkRow {
    const COLUMNS: &'static [&'static str] = &[
        "cod_colaborador",
        "cod_agencia",
        "data_inicio",
        "ativo",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountRow {
    pub num_conta: i64,
    pub cod_cliente: Option<i64>,
    pub cod_agencia: Option<i64>,
    pub cod_colaborador: Option<i64>,
    pub tipo_conta: String,
    pub tipo_conta_descricao: Option<String>,
    pub data_abertura: NaiveDateTime,
    pub saldo_total: Option<f64>,
    pub saldo_disponivel: Option<f64>,
    pub data_ultimo_lancamento: Option<NaiveDateTime>,
}

impl TableRow for AccountRow {
    const COLUMNS: &'static [&'static str] = &[
        "num_conta",
        "cod_cliente",
        "cod_agencia",
        "cod_colaborador",
        "tipo_conta",
        "tipo_conta_descricao",
        "data_abertura",
        "saldo_total",
        "saldo_disponivel",
        "data_ultimo_lancamento",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalRow {
    pub cod_proposta: i64,
    pub cod_cliente: Option<i64>,
    pub cod_colaborador: Option<i64>,
    pub data_entrada_proposta: NaiveDateTime,
    pub taxa_juros_mensal: Option<f64>,
    pub valor_proposta: f64,
    pub valor_financiamento: Option<f64>,
    pub valor_entrada: Option<f64>,
    pub valor_prestacao: Option<f64>,
    pub quantidade_parcelas: Option<i64>,
    pub carencia: Option<i64>,
    pub status_proposta: String,
    /// Percentage; 0 for proposals that were not approved
    pub taxa_aprovacao_colab: Option<f64>,
    /// Percentage; 0 for proposals that were not approved
    pub taxa_aprovacao_cliente: Option<f64>,
    pub media_status_cliente: Option<f64>,
    pub total_propostas_cliente: Option<usize>,
    pub diferenca_media_cliente: Option<f64>,
}

impl TableRow for ProposalRow {
    const COLUMNS: &'static [&'static str] = &[
        "cod_proposta",
        "cod_cliente",
        "cod_colaborador",
        "data_entrada_proposta",
        "taxa_juros_mensal",
        "valor_proposta",
        "valor_financiamento",
        "valor_entrada",
        "valor_prestacao",
        "quantidade_parcelas",
        "carencia",
        "status_proposta",
        "taxa_aprovacao_colab",
        "taxa_aprovacao_cliente",
        "media_status_cliente",
        "total_propostas_cliente",
        "diferenca_media_cliente",
    ];
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct OutputBuilder<'a> {
    config: &'a TransformConfig,
    processing_date: NaiveDate,
}

impl<'a> OutputBuilder<'a> {
    pub fn new(config: &'a TransformConfig, processing_date: NaiveDate) -> Self {
        OutputBuilder {
            config,
            processing_date,
        }
    }

    fn region_name(&self, code: &str) -> Option<String> {
        self.config.region_names.get(code).cloned()
    }

    /// Branch aggregates use every account, but only accepted transactions
    pub fn branches(
        &self,
        branches: &[Branch],
        accounts: &[Account],
        accepted: &[EnrichedTransaction],
    ) -> Vec<BranchRow> {
        let mut balances: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
        let mut account_counts: BTreeMap<i64, usize> = BTreeMap::new();
        for account in accounts {
            let Some(branch_id) = account.branch_id else {
                continue;
            };
            *account_counts.entry(branch_id).or_insert(0) += 1;
            if let Some(balance) = account.available_balance {
                let entry = balances.entry(branch_id).or_insert((0.0, 0));
                entry.0 += balance;
                entry.1 += 1;
            }
        }

        let mut volumes: BTreeMap<i64, f64> = BTreeMap::new();
        for tx in accepted {
            if let Some(branch_id) = tx.cod_agencia {
                *volumes.entry(branch_id).or_insert(0.0) += tx.valor_transacao;
            }
        }

        branches
            .iter()
            .map(|branch| BranchRow {
                cod_agencia: branch.id,
                nome: branch.name.clone(),
                endereco: branch.address.clone(),
                cidade: branch.city.clone(),
                uf: branch.region.clone(),
                uf_nome: self.region_name(&branch.region),
                data_abertura: branch.opened_on,
                tipo_agencia: branch.branch_type.clone(),
                saldo_medio: balances
                    .get(&branch.id)
                    .map(|(total, count)| total / *count as f64),
                num_contas: account_counts.get(&branch.id).copied().unwrap_or(0),
                volume_transacoes: volumes.get(&branch.id).copied().unwrap_or(0.0),
            })
            .collect()
    }

    /// Age and tenure are measured at the processing date
    pub fn clients(&self, clients: &[Client]) -> (Vec<ClientRow>, Vec<Diagnostic>) {
        let mut flags = Vec::new();

        let rows = clients
            .iter()
            .map(|client| {
                let idade = client
                    .birth_date
                    .map(|birth| age_in_years(birth, self.processing_date));
                let idade_alerta = idade.and_then(|age| age_flag(age, &self.config.age_bounds));
                if let (Some(reason), Some(age)) = (idade_alerta, idade) {
                    flags.push(
                        Diagnostic::flagged(
                            Stage::Derive,
                            SourceTable::Clients,
                            client.line,
                            reason,
                            format!("idade = {}", age),
                        )
                        .with_key(client.id),
                    );
                }

                ClientRow {
                    cod_cliente: client.id,
                    nome_completo: client.full_name(),
                    email: client.email.clone(),
                    tipo_cliente: client.client_type.clone(),
                    tipo_cliente_descricao: client
                        .client_type
                        .as_ref()
                        .and_then(|t| self.config.client_type_labels.get(t).cloned()),
                    data_inclusao: client.registered_at,
                    cpfcnpj: client.tax_id.clone(),
                    data_nascimento: client.birth_date,
                    endereco: client.address.clone(),
                    cep: client.postal_code.clone(),
                    uf: client.region.clone(),
                    uf_nome: client.region.as_deref().and_then(|r| self.region_name(r)),
                    idade,
                    idade_alerta,
                    tempo_como_cliente_meses: client
                        .registered_at
                        .map(|at| months_between(at.date(), self.processing_date)),
                }
            })
            .collect();

        (rows, flags)
    }

    /// Employees whose assigned branch does not exist are excluded
    pub fn employees(
        &self,
        employees: &[Employee],
        assignments: &BTreeMap<i64, BranchAssignment>,
        branches: &KeyedIndex<'_, Branch>,
    ) -> (Vec<EmployeeRow>, Vec<Diagnostic>) {
        let mut rows = Vec::with_capacity(employees.len());
        let mut diagnostics = Vec::new();

        for employee in employees {
            let assignment = assignments.get(&employee.id);
            let branch = match assignment {
                Some(a) => match branches.get(a.branch_id) {
                    Some(branch) => Some(branch),
                    None => {
                        diagnostics.push(
                            Diagnostic::excluded(
                                Stage::Join,
                                SourceTable::Employees,
                                employee.line,
                                ReasonCode::UnresolvedBranch,
                                format!("cod_agencia {} not found", a.branch_id),
                            )
                            .with_key(employee.id),
                        );
                        continue;
                    }
                },
                None => None,
            };

            rows.push(EmployeeRow {
                cod_colaborador: employee.id,
                nome_completo: employee.full_name(),
                email: employee.email.clone(),
                cpf: employee.tax_id.clone(),
                data_nascimento: employee.birth_date,
                endereco: employee.address.clone(),
                cep: employee.postal_code.clone(),
                cod_agencia: branch.map(|b| b.id),
                nome_agencia: branch.map(|b| b.name.clone()),
            });
        }

        (rows, diagnostics)
    }

    /// Repeated (employee, branch, start) links collapse into the first one
    pub fn links(
        &self,
        links: &[BranchEmployeeLink],
        assignments: &BTreeMap<i64, BranchAssignment>,
    ) -> Vec<LinkRow> {
        let mut seen = BTreeSet::new();
        links
            .iter()
            .filter(|link| seen.insert((link.employee_id, link.branch_id, link.effective_from)))
            .map(|link| LinkRow {
                cod_colaborador: link.employee_id,
                cod_agencia: link.branch_id,
                data_inicio: link.effective_from,
                ativo: assignments.get(&link.employee_id).is_some_and(|a| {
                    a.branch_id == link.branch_id && a.effective_from == link.effective_from
                }),
            })
            .collect()
    }

    pub fn accounts(&self, accounts: &[Account]) -> Vec<AccountRow> {
        accounts
            .iter()
            .map(|account| AccountRow {
                num_conta: account.id,
                cod_cliente: account.client_id,
                cod_agencia: account.branch_id,
                cod_colaborador: account.employee_id,
                tipo_conta: account.account_type.clone(),
                tipo_conta_descricao: self
                    .config
                    .account_type_labels
                    .get(&account.account_type)
                    .cloned(),
                data_abertura: account.opened_at,
                saldo_total: account.total_balance,
                saldo_disponivel: account.available_balance,
                data_ultimo_lancamento: account.last_activity_at,
            })
            .collect()
    }

    pub fn proposals(&self, proposals: &[CreditProposal]) -> Vec<ProposalRow> {
        let approved = &self.config.approved_status;
        let stats = ProposalStats::collect(proposals, approved);

        proposals
            .iter()
            .map(|p| {
                let is_approved = p.is_approved(approved);
                let zero_unless_approved = |rate: Option<f64>| {
                    if is_approved {
                        rate
                    } else {
                        Some(0.0)
                    }
                };
                let media = p
                    .client_id
                    .and_then(|c| stats.mean_by_status_client.get(&(p.status.clone(), c)))
                    .map(|(total, count)| total / *count as f64);

                ProposalRow {
                    cod_proposta: p.id,
                    cod_cliente: p.client_id,
                    cod_colaborador: p.employee_id,
                    data_entrada_proposta: p.submitted_at,
                    taxa_juros_mensal: p.monthly_rate,
                    valor_proposta: p.amount,
                    valor_financiamento: p.financed_amount,
                    valor_entrada: p.down_payment,
                    valor_prestacao: p.installment_amount,
                    quantidade_parcelas: p.installments,
                    carencia: p.grace_period,
                    status_proposta: p.status.clone(),
                    taxa_aprovacao_colab: zero_unless_approved(
                        p.employee_id.and_then(|e| stats.by_employee.get(&e)).map(Tally::rate),
                    ),
                    taxa_aprovacao_cliente: zero_unless_approved(
                        p.client_id.and_then(|c| stats.by_client.get(&c)).map(Tally::rate),
                    ),
                    media_status_cliente: media,
                    total_propostas_cliente: p
                        .client_id
                        .and_then(|c| stats.by_client.get(&c))
                        .map(|t| t.total),
                    diferenca_media_cliente: media.map(|m| p.amount - m),
                }
            })
            .collect()
    }
}

// ============================================================================
// PROPOSAL AGGREGATES
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    approved: usize,
    total: usize,
}

impl Tally {
    fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.approved as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct ProposalStats {
    by_employee: BTreeMap<i64, Tally>,
    by_client: BTreeMap<i64, Tally>,
    mean_by_status_client: BTreeMap<(String, i64), (f64, usize)>,
}

impl ProposalStats {
    fn collect(proposals: &[CreditProposal], approved_status: &str) -> Self {
        let mut stats = ProposalStats::default();

        for p in proposals {
            let approved = usize::from(p.is_approved(approved_status));
            if let Some(employee) = p.employee_id {
                let tally = stats.by_employee.entry(employee).or_default();
                tally.approved += approved;
                tally.total += 1;
            }
            if let Some(client) = p.client_id {
                let tally = stats.by_client.entry(client).or_default();
                tally.approved += approved;
                tally.total += 1;

                let entry = stats
                    .mean_by_status_client
                    .entry((p.status.clone(), client))
                    .or_insert((0.0, 0));
                entry.0 += p.amount;
                entry.1 += 1;
            }
        }

        stats
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::resolve_assignments;
    use crate::join::tests::{account, branch, client, ts};

    fn proposal(id: i64, client: i64, employee: i64, amount: f64, status: &str) -> CreditProposal {
        CreditProposal {
            id,
            client_id: Some(client),
            employee_id: Some(employee),
            submitted_at: ts("2021-03-01 12:00:00"),
            monthly_rate: Some(0.02),
            amount,
            financed_amount: None,
            down_payment: None,
            installment_amount: None,
            installments: Some(24),
            grace_period: Some(0),
            status: status.to_string(),
            line: id as u64 + 1,
        }
    }

    fn builder(config: &TransformConfig) -> OutputBuilder<'_> {
        OutputBuilder::new(config, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
    }

    #[test]
    fn test_proposal_rates_and_client_means() {
        let config = TransformConfig::default();
        let rows = builder(&config).proposals(&[
            proposal(1, 100, 7, 1000.0, "Aprovada"),
            proposal(2, 100, 7, 3000.0, "Aprovada"),
            proposal(3, 100, 8, 500.0, "Negada"),
            proposal(4, 200, 7, 800.0, "Negada"),
        ]);

        // employee 7: 2 approved out of 3
        let rate = rows[0].taxa_aprovacao_colab.unwrap();
        assert!((rate - 200.0 / 3.0).abs() < 1e-9);
        // rejected proposals get zeroed rates
        assert_eq!(rows[3].taxa_aprovacao_colab, Some(0.0));
        assert_eq!(rows[2].taxa_aprovacao_cliente, Some(0.0));

        assert_eq!(rows[0].media_status_cliente, Some(2000.0));
        assert_eq!(rows[0].diferenca_media_cliente, Some(-1000.0));
        assert_eq!(rows[2].media_status_cliente, Some(500.0));
        assert_eq!(rows[0].total_propostas_cliente, Some(3));
    }

    #[test]
    fn test_branch_aggregates() {
        let config = TransformConfig::default();
        let mut second = account(11, Some(1), Some(1));
        second.available_balance = Some(200.0);
        let accounts = vec![account(10, Some(1), Some(1)), second, account(12, None, Some(2))];

        let rows = builder(&config).branches(&[branch(1), branch(3)], &accounts, &[]);

        assert_eq!(rows[0].num_contas, 2);
        assert_eq!(rows[0].saldo_medio, Some(500.0));
        assert_eq!(rows[0].uf_nome.as_deref(), Some("São Paulo"));
        assert_eq!(rows[1].num_contas, 0);
        assert_eq!(rows[1].saldo_medio, None);
        assert_eq!(rows[1].volume_transacoes, 0.0);
    }

    #[test]
    fn test_client_age_at_processing_date() {
        let config = TransformConfig::default();
        let mut c = client(1);
        c.registered_at = Some(ts("2022-01-31 08:00:00"));

        let (rows, flags) = builder(&config).clients(&[c]);

        assert_eq!(rows[0].idade, Some(34));
        assert_eq!(rows[0].tempo_como_cliente_meses, Some(24));
        assert_eq!(rows[0].nome_completo, "Ana Souza");
        assert_eq!(rows[0].tipo_cliente_descricao.as_deref(), Some("Pessoa Física"));
        assert!(flags.is_empty());
    }

    #[test]
    fn test_employee_with_unknown_branch_excluded() {
        let config = TransformConfig::default();
        let branches = vec![branch(1)];
        let index = KeyedIndex::build(&branches).unwrap();
        let links = vec![
            BranchEmployeeLink {
                employee_id: 1,
                branch_id: 1,
                effective_from: None,
                line: 2,
            },
            BranchEmployeeLink {
                employee_id: 2,
                branch_id: 99,
                effective_from: None,
                line: 3,
            },
        ];
        let assignments = resolve_assignments(&links);
        let employee = |id: i64| Employee {
            id,
            first_name: "Caio".to_string(),
            last_name: None,
            email: None,
            tax_id: None,
            birth_date: None,
            address: None,
            postal_code: None,
            line: id as u64 + 1,
        };

        let (rows, diagnostics) =
            builder(&config).employees(&[employee(1), employee(2), employee(3)], &assignments, &index);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].nome_agencia.as_deref(), Some("Agencia 1"));
        assert_eq!(rows[1].cod_agencia, None);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].reason, ReasonCode::UnresolvedBranch);

        let link_rows = builder(&config).links(&links, &assignments);
        assert!(link_rows.iter().all(|l| l.ativo));
    }

    #[test]
    fn test_repeated_link_marked_active_once() {
        let config = TransformConfig::default();
        let link = |branch_id: i64, line: u64| BranchEmployeeLink {
            employee_id: 7,
            branch_id,
            effective_from: NaiveDate::from_ymd_opt(2021, 6, 1),
            line,
        };
        let links = vec![link(1, 2), link(1, 3), link(2, 4)];
        let assignments = resolve_assignments(&links);

        let rows = builder(&config).links(&links, &assignments);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|l| l.ativo).count(), 1);
        assert!(rows[0].ativo);
        assert_eq!(rows[1].cod_agencia, 2);
    }
}
