// 🚀 Transform Pipeline - one batch run from raw tables to published outputs
//
// normalize → decode → join → derive → quality gate → output tables
//
// Each stage consumes its input by value and hands a new set to the next.
// Every source transaction row is accounted for exactly once: it either ends
// up in `transacoes_tratado` or in `transacoes_rejeitadas`.

use crate::checkpoint::{CheckpointStore, Snapshot};
use crate::config::TransformConfig;
use crate::derive::{DerivationEngine, EnrichedTransaction};
use crate::entities::{
    decode_table, Account, Branch, BranchEmployeeLink, Client, CreditProposal, Employee, Record,
    Transaction,
};
use crate::error::{PipelineError, Result};
use crate::join::{
    ensure_cardinality, resolve_assignments, EntityJoiner, KeyedIndex, RejectedTransaction,
};
use crate::normalizer::{FieldNormalizer, DATE_FORMAT};
use crate::outputs::OutputBuilder;
use crate::quality::{ensure_publishable, QualityGate, QualityReport};
use crate::report::{Diagnostic, Stage, TransformReport};
use crate::sink::CsvSink;
use crate::source::{read_all, RawTable, SourceReader, SourceSet, SourceTable};
use chrono::NaiveDate;
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

pub const STAGE_NORMALIZED: &str = "normalized";
pub const STAGE_FINAL: &str = "final";

/// Output tables, in publish order
pub const OUTPUT_TABLES: [&str; 8] = [
    "agencias_tratado",
    "clientes_tratado",
    "colaborador_agencia_tratado",
    "colaboradores_tratado",
    "contas_tratado",
    "propostas_credito_tratado",
    "transacoes_tratado",
    "transacoes_rejeitadas",
];

// ============================================================================
// RUN OUTPUT
// ============================================================================

#[derive(Debug)]
pub struct TransformOutput {
    pub run_id: String,
    pub processing_date: NaiveDate,
    pub accepted: Vec<EnrichedTransaction>,
    pub rejected: Vec<RejectedTransaction>,
    /// One snapshot per entry of `OUTPUT_TABLES`
    pub tables: Vec<Snapshot>,
    pub quality: QualityReport,
    pub report: TransformReport,
}

impl TransformOutput {
    pub fn table(&self, name: &str) -> Option<&Snapshot> {
        self.tables.iter().find(|t| t.table == name)
    }
}

/// Per-run mutable state shared by the stage helpers
struct RunState {
    run_id: String,
    processing_date: NaiveDate,
    report: TransformReport,
    rejected: Vec<RejectedTransaction>,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct TransformPipeline<'a> {
    config: &'a TransformConfig,
    checkpoints: Option<&'a mut dyn CheckpointStore>,
}

impl<'a> TransformPipeline<'a> {
    pub fn new(config: &'a TransformConfig) -> Self {
        TransformPipeline {
            config,
            checkpoints: None,
        }
    }

    /// Builder: persist normalized and final snapshots
    pub fn with_checkpoints(mut self, store: &'a mut dyn CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Read every table from the reader, then transform
    pub fn run(&mut self, reader: &dyn SourceReader) -> Result<TransformOutput> {
        let sources = read_all(reader)?;
        self.transform(sources)
    }

    /// Run, then publish through the sink; nothing is written on failure
    pub fn run_and_publish(
        &mut self,
        reader: &dyn SourceReader,
        sink: &CsvSink,
    ) -> Result<(TransformOutput, Vec<PathBuf>)> {
        let output = self.run(reader)?;
        let paths = sink.publish(&output.tables, &output.report)?;
        Ok((output, paths))
    }

    pub fn transform(&mut self, mut sources: SourceSet) -> Result<TransformOutput> {
        self.config.validate()?;

        for table in SourceTable::ALL {
            if !sources.contains_key(&table) {
                return Err(PipelineError::MissingTable(table.name().to_string()));
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let processing_date = self.config.processing_date();
        let mut state = RunState {
            report: TransformReport::new(
                &run_id,
                &processing_date.format(DATE_FORMAT).to_string(),
            ),
            run_id,
            processing_date,
            rejected: Vec::new(),
        };
        info!(run_id = %state.run_id, %processing_date, "transform started");

        let source_transactions = table_len(&sources, SourceTable::Transactions);
        if source_transactions == 0 {
            return Err(PipelineError::EmptySource(
                SourceTable::Transactions.name().to_string(),
            ));
        }
        state.report.source_transactions = source_transactions;

        // ====================================================================
        // NORMALIZE + DECODE
        // ====================================================================
        let normalizer = FieldNormalizer::new(self.config);
        let branches: Vec<Branch> = self.prepare(
            &normalizer,
            &mut state,
            take(&mut sources, SourceTable::Branches)?,
        )?;
        let clients: Vec<Client> = self.prepare(
            &normalizer,
            &mut state,
            take(&mut sources, SourceTable::Clients)?,
        )?;
        let employees: Vec<Employee> = self.prepare(
            &normalizer,
            &mut state,
            take(&mut sources, SourceTable::Employees)?,
        )?;
        let links: Vec<BranchEmployeeLink> = self.prepare(
            &normalizer,
            &mut state,
            take(&mut sources, SourceTable::BranchEmployeeLinks)?,
        )?;
        let accounts: Vec<Account> = self.prepare(
            &normalizer,
            &mut state,
            take(&mut sources, SourceTable::Accounts)?,
        )?;
        let proposals: Vec<CreditProposal> = self.prepare(
            &normalizer,
            &mut state,
            take(&mut sources, SourceTable::CreditProposals)?,
        )?;
        let transactions: Vec<Transaction> = self.prepare(
            &normalizer,
            &mut state,
            take(&mut sources, SourceTable::Transactions)?,
        )?;

        // Keys must be unique even for tables that are never joined on
        KeyedIndex::build(&employees)?;
        KeyedIndex::build(&proposals)?;

        // ====================================================================
        // JOIN
        // ====================================================================
        let assignments = resolve_assignments(&links);
        let joiner = EntityJoiner::new(
            self.config.join_policy,
            &accounts,
            &clients,
            &branches,
            &assignments,
        )?;

        let join_input = transactions.len();
        let join = joiner.join(transactions)?;
        let mut join_diagnostics: Vec<Diagnostic> =
            join.rejected.iter().map(RejectedTransaction::diagnostic).collect();
        join_diagnostics.extend(join.flags);
        record_stage(
            &mut state.report,
            Stage::Join,
            SourceTable::Transactions,
            join_input,
            join.joined.len(),
            &join_diagnostics,
        );
        state.rejected.extend(join.rejected);

        // ====================================================================
        // DERIVE
        // ====================================================================
        let engine = DerivationEngine::new(self.config);
        let derive_input = join.joined.len();
        let (enriched, derive_flags) = engine.derive(join.joined);
        record_stage(
            &mut state.report,
            Stage::Derive,
            SourceTable::Transactions,
            derive_input,
            enriched.len(),
            &derive_flags,
        );

        // ====================================================================
        // QUALITY GATE
        // ====================================================================
        let gate = QualityGate::new(self.config.join_policy);
        let gate_input = enriched.len();
        let outcome = gate.apply(enriched);
        let gate_diagnostics: Vec<Diagnostic> =
            outcome.rejected.iter().map(RejectedTransaction::diagnostic).collect();
        record_stage(
            &mut state.report,
            Stage::QualityGate,
            SourceTable::Transactions,
            gate_input,
            outcome.accepted.len(),
            &gate_diagnostics,
        );
        state.rejected.extend(outcome.rejected);
        let accepted = outcome.accepted;

        ensure_cardinality(
            "ledger/transactions",
            source_transactions,
            accepted.len() + state.rejected.len(),
        )?;
        ensure_publishable(source_transactions, accepted.len())?;

        // ====================================================================
        // OUTPUT TABLES
        // ====================================================================
        let builder = OutputBuilder::new(self.config, state.processing_date);
        let branch_rows = builder.branches(&branches, &accounts, &accepted);
        let (client_rows, client_flags) = builder.clients(&clients);
        record_stage(
            &mut state.report,
            Stage::Derive,
            SourceTable::Clients,
            clients.len(),
            client_rows.len(),
            &client_flags,
        );
        let link_rows = builder.links(&links, &assignments);
        let (employee_rows, employee_diagnostics) =
            builder.employees(&employees, &assignments, joiner.branches());
        record_stage(
            &mut state.report,
            Stage::Join,
            SourceTable::Employees,
            employees.len(),
            employee_rows.len(),
            &employee_diagnostics,
        );
        let account_rows = builder.accounts(&accounts);
        let proposal_rows = builder.proposals(&proposals);

        let tables = vec![
            Snapshot::from_records(OUTPUT_TABLES[0], &branch_rows)?,
            Snapshot::from_records(OUTPUT_TABLES[1], &client_rows)?,
            Snapshot::from_records(OUTPUT_TABLES[2], &link_rows)?,
            Snapshot::from_records(OUTPUT_TABLES[3], &employee_rows)?,
            Snapshot::from_records(OUTPUT_TABLES[4], &account_rows)?,
            Snapshot::from_records(OUTPUT_TABLES[5], &proposal_rows)?,
            Snapshot::from_records(OUTPUT_TABLES[6], &accepted)?,
            Snapshot::from_records(OUTPUT_TABLES[7], &state.rejected)?,
        ];
        for snapshot in &tables {
            self.save_checkpoint(&state.run_id, STAGE_FINAL, snapshot)?;
        }

        let mut report = state.report;
        report.accepted_transactions = accepted.len();
        report.rejected_transactions = state.rejected.len();
        for rejected in &state.rejected {
            *report
                .rejected_by_reason
                .entry(rejected.reason.as_str().to_string())
                .or_insert(0) += 1;
        }
        info!("{}", report.summary());

        Ok(TransformOutput {
            run_id: state.run_id,
            processing_date: state.processing_date,
            accepted,
            rejected: state.rejected,
            tables,
            quality: outcome.report,
            report,
        })
    }

    /// Normalize, checkpoint, decode and screen one table
    fn prepare<T: Record>(
        &mut self,
        normalizer: &FieldNormalizer,
        state: &mut RunState,
        raw: RawTable,
    ) -> Result<Vec<T>> {
        let table = raw.table;
        let input = raw.len();

        let (normalized, normalize_diagnostics) = normalizer.normalize_table(raw);
        record_stage(
            &mut state.report,
            Stage::Normalize,
            table,
            input,
            normalized.len(),
            &normalize_diagnostics,
        );
        self.save_checkpoint(&state.run_id, STAGE_NORMALIZED, &Snapshot::from_raw(&normalized)?)?;

        let (decoded, mut decode_diagnostics) = decode_table::<T>(&normalized);
        let mut records = Vec::with_capacity(decoded.len());
        for record in decoded {
            match record.screen(state.processing_date) {
                Some((reason, detail)) => {
                    let mut diagnostic =
                        Diagnostic::excluded(Stage::Decode, table, record.line(), reason, detail);
                    diagnostic.key = record.record_key();
                    decode_diagnostics.push(diagnostic);
                }
                None => records.push(record),
            }
        }
        record_stage(
            &mut state.report,
            Stage::Decode,
            table,
            normalized.len(),
            records.len(),
            &decode_diagnostics,
        );

        if table == SourceTable::Transactions {
            state.rejected.extend(
                normalize_diagnostics
                    .iter()
                    .chain(&decode_diagnostics)
                    .filter(|d| d.is_exclusion())
                    .map(RejectedTransaction::from_diagnostic),
            );
        }

        Ok(records)
    }

    fn save_checkpoint(&mut self, run_id: &str, stage: &str, snapshot: &Snapshot) -> Result<()> {
        if let Some(store) = self.checkpoints.as_deref_mut() {
            store.save(run_id, stage, snapshot)?;
        }
        Ok(())
    }
}

fn take(sources: &mut SourceSet, table: SourceTable) -> Result<RawTable> {
    sources
        .remove(&table)
        .ok_or_else(|| PipelineError::MissingTable(table.name().to_string()))
}

fn table_len(sources: &SourceSet, table: SourceTable) -> usize {
    sources.get(&table).map(RawTable::len).unwrap_or(0)
}

/// Record stage counts and trace each diagnostic
fn record_stage(
    report: &mut TransformReport,
    stage: Stage,
    table: SourceTable,
    input: usize,
    output: usize,
    diagnostics: &[Diagnostic],
) {
    for d in diagnostics {
        debug!(
            stage = d.stage.as_str(),
            table = %d.table,
            line = d.line,
            key = d.key.as_deref().unwrap_or(""),
            reason = %d.reason,
            detail = %d.detail,
            "diagnostic"
        );
    }
    info!(
        stage = stage.as_str(),
        table = %table,
        input,
        output,
        diagnostics = diagnostics.len(),
        "stage complete"
    );
    report.record_stage(stage, table, input, output, diagnostics);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::report::ReasonCode;
    use crate::source::MemorySourceReader;

    fn reader() -> MemorySourceReader {
        MemorySourceReader::new()
            .with_table(SourceTable::Branches, "cod_agencia,nome,uf\n1,Centro,São Paulo\n")
            .with_table(
                SourceTable::Clients,
                "cod_cliente,primeiro_nome,ultimo_nome,data_nascimento\n\
                 1,Ana,Souza,15/01/1990\n\
                 2,Bia,Lima,01/01/2999\n",
            )
            .with_table(SourceTable::Employees, "cod_colaborador,primeiro_nome\n7,Caio\n")
            .with_table(SourceTable::BranchEmployeeLinks, "cod_colaborador,cod_agencia\n7,1\n")
            .with_table(
                SourceTable::Accounts,
                "num_conta,cod_cliente,cod_agencia,cod_colaborador,tipo_conta,data_abertura,saldo_disponivel\n\
                 10,1,1,7,PF,2015-03-10 09:00:00 UTC,\"1.000,00\"\n",
            )
            .with_table(
                SourceTable::CreditProposals,
                "cod_proposta,cod_cliente,cod_colaborador,data_entrada_proposta,valor_proposta,status_proposta\n\
                 1,1,7,2020-02-01 10:00:00 UTC,5000,Aprovada\n",
            )
            .with_table(
                SourceTable::Transactions,
                "cod_transacao,num_conta,data_transacao,nome_transacao,valor_transacao\n\
                 100,10,2020-01-14 10:30:00 UTC,Pix - Realizado,-50\n\
                 101,99,2020-01-15 10:30:00 UTC,TED - Recebido,70\n\
                 102,10,ontem,Saque,10\n",
            )
    }

    fn config() -> TransformConfig {
        TransformConfig {
            processing_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            ..TransformConfig::default()
        }
    }

    #[test]
    fn test_every_transaction_accounted_for() {
        let config = config();
        let output = TransformPipeline::new(&config).run(&reader()).unwrap();

        assert_eq!(output.report.source_transactions, 3);
        assert_eq!(output.accepted.len(), 1);
        assert_eq!(output.rejected.len(), 2);
        assert_eq!(output.report.rejected_by_reason["unresolved_account"], 1);
        assert_eq!(output.report.rejected_by_reason["invalid_date"], 1);
        assert_eq!(output.accepted[0].idade_cliente, Some(29));
        assert_eq!(output.tables.len(), OUTPUT_TABLES.len());
    }

    #[test]
    fn test_future_birth_date_excludes_client() {
        let config = config();
        let output = TransformPipeline::new(&config).run(&reader()).unwrap();

        let counts = output.report.stage(Stage::Decode, SourceTable::Clients).unwrap();
        assert_eq!(counts.input, 2);
        assert_eq!(counts.output, 1);
        assert_eq!(output.report.count_reason(ReasonCode::BirthDateInFuture), 1);
        assert_eq!(output.table("clientes_tratado").unwrap().row_count, 1);

        let excluded = output
            .report
            .diagnostics
            .iter()
            .find(|d| d.reason == ReasonCode::BirthDateInFuture)
            .unwrap();
        assert_eq!(excluded.key.as_deref(), Some("2"));
        assert_eq!(excluded.line, 3);
    }

    #[test]
    fn test_checkpoints_saved_per_stage() {
        let config = config();
        let mut store = MemoryCheckpointStore::new();
        let output = TransformPipeline::new(&config)
            .with_checkpoints(&mut store)
            .run(&reader())
            .unwrap();

        let entries = store.list(Some(&output.run_id)).unwrap();
        let normalized = entries.iter().filter(|e| e.stage == STAGE_NORMALIZED).count();
        let finals = entries.iter().filter(|e| e.stage == STAGE_FINAL).count();
        assert_eq!(normalized, SourceTable::ALL.len());
        assert_eq!(finals, OUTPUT_TABLES.len());
    }

    #[test]
    fn test_missing_table_is_fatal() {
        let config = config();
        let mut sources = read_all(&reader()).unwrap();
        sources.remove(&SourceTable::Employees);

        let err = TransformPipeline::new(&config).transform(sources).unwrap_err();
        assert!(matches!(err, PipelineError::MissingTable(ref t) if t == "employees"));
    }
}
