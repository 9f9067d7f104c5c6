// 🧹 Field Normalizer - per-column canonicalization
//
// Canonical forms:
//   dates       → YYYY-MM-DD
//   timestamps  → YYYY-MM-DDTHH:MM:SS[.fff]
//   identifiers → plain integer text, never through floating point
//   numbers     → shortest decimal (dot separator)
//   regions     → 2-letter code from the configured synonym table

use crate::config::{strip_accents, TransformConfig};
use crate::report::{Diagnostic, ReasonCode, Stage};
use crate::source::{row_key, RawRow, RawTable, SourceTable};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::StringRecord;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

// ============================================================================
// COLUMN RULES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRule {
    UppercaseTrim,
    Trim,
    RegionCodeMap,
    DateParse,
    TimestampParse,
    IdentifierCoerce,
    NumericCoerce,
}

/// Column rules applied to each source table
pub fn rules_for(table: SourceTable) -> Vec<(&'static str, ColumnRule)> {
    use ColumnRule::*;

    match table {
        SourceTable::Branches => vec![
            ("cod_agencia", IdentifierCoerce),
            ("nome", Trim),
            ("endereco", Trim),
            ("cidade", Trim),
            ("uf", RegionCodeMap),
            ("data_abertura", DateParse),
            ("tipo_agencia", Trim),
        ],
        SourceTable::Clients => vec![
            ("cod_cliente", IdentifierCoerce),
            ("primeiro_nome", Trim),
            ("ultimo_nome", Trim),
            ("email", Trim),
            ("tipo_cliente", UppercaseTrim),
            ("data_inclusao", TimestampParse),
            ("data_nascimento", DateParse),
            ("endereco", Trim),
            ("uf", RegionCodeMap),
        ],
        SourceTable::Employees => vec![
            ("cod_colaborador", IdentifierCoerce),
            ("primeiro_nome", Trim),
            ("ultimo_nome", Trim),
            ("email", Trim),
            ("data_nascimento", DateParse),
        ],
        SourceTable::BranchEmployeeLinks => vec![
            ("cod_colaborador", IdentifierCoerce),
            ("cod_agencia", IdentifierCoerce),
            ("data_inicio", DateParse),
        ],
        SourceTable::Accounts => vec![
            ("num_conta", IdentifierCoerce),
            ("cod_cliente", IdentifierCoerce),
            ("cod_agencia", IdentifierCoerce),
            ("cod_colaborador", IdentifierCoerce),
            ("tipo_conta", UppercaseTrim),
            ("data_abertura", TimestampParse),
            ("saldo_total", NumericCoerce),
            ("saldo_disponivel", NumericCoerce),
            ("data_ultimo_lancamento", TimestampParse),
        ],
        SourceTable::CreditProposals => vec![
            ("cod_proposta", IdentifierCoerce),
            ("cod_cliente", IdentifierCoerce),
            ("cod_colaborador", IdentifierCoerce),
            ("data_entrada_proposta", TimestampParse),
            ("taxa_juros_mensal", NumericCoerce),
            ("valor_proposta", NumericCoerce),
            ("valor_financiamento", NumericCoerce),
            ("valor_entrada", NumericCoerce),
            ("valor_prestacao", NumericCoerce),
            ("quantidade_parcelas", NumericCoerce),
            ("carencia", NumericCoerce),
            ("status_proposta", Trim),
        ],
        SourceTable::Transactions => vec![
            ("cod_transacao", IdentifierCoerce),
            ("num_conta", IdentifierCoerce),
            ("data_transacao", TimestampParse),
            ("nome_transacao", Trim),
            ("valor_transacao", NumericCoerce),
            ("categoria", Trim),
        ],
    }
}

// ============================================================================
// REGION CODE MAP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionLookup {
    Mapped(String),
    Unmapped(String),
}

impl RegionLookup {
    pub fn code(&self) -> &str {
        match self {
            RegionLookup::Mapped(code) | RegionLookup::Unmapped(code) => code,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, RegionLookup::Mapped(_))
    }
}

/// Synonym table with folded keys; every target code also maps to itself
#[derive(Debug, Clone)]
pub struct RegionCodeMap {
    synonyms: HashMap<String, String>,
}

impl RegionCodeMap {
    pub fn new(entries: &BTreeMap<String, String>) -> Self {
        let mut synonyms = HashMap::new();
        for (variant, code) in entries {
            let code = fold_region(code);
            synonyms.insert(fold_region(variant), code.clone());
            synonyms.insert(strip_accents(&fold_region(variant)), code.clone());
            synonyms.insert(code.clone(), code);
        }
        RegionCodeMap { synonyms }
    }

    pub fn lookup(&self, value: &str) -> RegionLookup {
        let folded = fold_region(value);
        let code = self
            .synonyms
            .get(&folded)
            .or_else(|| self.synonyms.get(&strip_accents(&folded)));

        match code {
            Some(code) => RegionLookup::Mapped(code.clone()),
            None => RegionLookup::Unmapped(folded),
        }
    }

    pub fn len(&self) -> usize {
        self.synonyms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synonyms.is_empty()
    }
}

/// Trim, uppercase, collapse inner whitespace
fn fold_region(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

// ============================================================================
// DATE PARSER
// ============================================================================

/// Ordered format lists; first successful parse wins
#[derive(Debug, Clone)]
pub struct DateParser {
    date_formats: Vec<String>,
    timestamp_formats: Vec<String>,
}

impl DateParser {
    pub fn new(date_formats: Vec<String>, timestamp_formats: Vec<String>) -> Self {
        DateParser {
            date_formats,
            timestamp_formats,
        }
    }

    pub fn parse_date(&self, value: &str) -> Option<NaiveDate> {
        let value = value.trim();
        self.date_formats
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
            .or_else(|| self.parse_datetime_only(value).map(|ts| ts.date()))
    }

    /// Timestamp formats first, then plain dates at midnight
    pub fn parse_timestamp(&self, value: &str) -> Option<NaiveDateTime> {
        let value = value.trim();
        self.parse_datetime_only(value).or_else(|| {
            self.date_formats
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
    }

    fn parse_datetime_only(&self, value: &str) -> Option<NaiveDateTime> {
        self.timestamp_formats
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
            .or_else(|| {
                DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|dt| dt.naive_utc())
            })
    }
}

// ============================================================================
// NUMERIC COERCION
// ============================================================================

/// Accepts "1234.56", "1.234,56", "1234,56", "R$ 10,00", "1,234,567"
pub fn coerce_number(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .replace("R$", "")
        .replace('$', "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let canonical = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // Decimal comma with dot thousands separators
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        // Decimal dot with comma thousands separators
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // A separator that repeats can only be grouping
        (Some(_), None) if is_grouped(&cleaned, ',') => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        (None, Some(_)) if is_grouped(&cleaned, '.') => cleaned.replace('.', ""),
        _ => cleaned,
    };

    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// "1,234,567": at least two separators, 1-3 leading digits, then groups of three
fn is_grouped(value: &str, separator: char) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let groups: Vec<&str> = digits.split(separator).collect();
    groups.len() > 2
        && (1..=3).contains(&groups[0].len())
        && groups.iter().all(|g| g.bytes().all(|b| b.is_ascii_digit()))
        && groups[1..].iter().all(|g| g.len() == 3)
}

/// Integer identifiers stay exact; "42.0" from float-typed exports is accepted
pub fn coerce_identifier(value: &str) -> Option<i64> {
    let value = value.trim();
    let digits = match value.split_once('.') {
        Some((int, frac)) if !frac.is_empty() && frac.bytes().all(|b| b == b'0') => int,
        Some(_) => return None,
        None => value,
    };
    digits.parse::<i64>().ok()
}

// ============================================================================
// FIELD NORMALIZER
// ============================================================================

/// Outcome for a single cell
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedValue {
    pub value: String,
    pub flag: Option<ReasonCode>,
}

impl NormalizedValue {
    fn clean(value: String) -> Self {
        NormalizedValue { value, flag: None }
    }
}

pub struct FieldNormalizer {
    regions: RegionCodeMap,
    dates: DateParser,
    address_region_patterns: Vec<Regex>,
}

impl FieldNormalizer {
    pub fn new(config: &TransformConfig) -> Self {
        FieldNormalizer {
            regions: RegionCodeMap::new(&config.region_code_map),
            dates: DateParser::new(config.date_formats.clone(), config.timestamp_formats.clone()),
            address_region_patterns: address_region_patterns(),
        }
    }

    pub fn regions(&self) -> &RegionCodeMap {
        &self.regions
    }

    pub fn dates(&self) -> &DateParser {
        &self.dates
    }

    /// Normalize one cell. Empty cells stay empty.
    pub fn normalize_value(
        &self,
        rule: ColumnRule,
        value: &str,
    ) -> Result<NormalizedValue, ReasonCode> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(NormalizedValue::clean(String::new()));
        }

        match rule {
            ColumnRule::Trim => Ok(NormalizedValue::clean(trimmed.to_string())),
            ColumnRule::UppercaseTrim => Ok(NormalizedValue::clean(trimmed.to_uppercase())),
            ColumnRule::RegionCodeMap => Ok(match self.regions.lookup(trimmed) {
                RegionLookup::Mapped(code) => NormalizedValue::clean(code),
                RegionLookup::Unmapped(code) => NormalizedValue {
                    value: code,
                    flag: Some(ReasonCode::UnmappedRegionCode),
                },
            }),
            ColumnRule::DateParse => self
                .dates
                .parse_date(trimmed)
                .map(|d| NormalizedValue::clean(d.format(DATE_FORMAT).to_string()))
                .ok_or(ReasonCode::InvalidDate),
            ColumnRule::TimestampParse => self
                .dates
                .parse_timestamp(trimmed)
                .map(|ts| NormalizedValue::clean(ts.format(TIMESTAMP_FORMAT).to_string()))
                .ok_or(ReasonCode::InvalidDate),
            ColumnRule::IdentifierCoerce => coerce_identifier(trimmed)
                .map(|id| NormalizedValue::clean(id.to_string()))
                .ok_or(ReasonCode::InvalidNumber),
            ColumnRule::NumericCoerce => coerce_number(trimmed)
                .map(|n| NormalizedValue::clean(n.to_string()))
                .ok_or(ReasonCode::InvalidNumber),
        }
    }

    /// Apply the table's rules; rows with an unparseable cell are excluded.
    /// Rules naming columns absent from the header are skipped.
    pub fn normalize_table(&self, raw: RawTable) -> (RawTable, Vec<Diagnostic>) {
        let raw = if raw.table == SourceTable::Clients {
            self.fill_client_regions(raw)
        } else {
            raw
        };

        let rules: Vec<(usize, &'static str, ColumnRule)> = rules_for(raw.table)
            .into_iter()
            .filter_map(|(column, rule)| raw.column_index(column).map(|idx| (idx, column, rule)))
            .collect();

        let table = raw.table;
        let key_idx = raw.key_index();
        let mut diagnostics = Vec::new();
        let mut rows = Vec::with_capacity(raw.rows.len());

        'rows: for row in raw.rows {
            let mut fields: Vec<String> = row.record.iter().map(|f| f.to_string()).collect();

            for &(idx, column, rule) in &rules {
                let Some(value) = fields.get(idx) else {
                    continue;
                };

                match self.normalize_value(rule, value) {
                    Ok(normalized) => {
                        if let Some(flag) = normalized.flag {
                            let mut diagnostic = Diagnostic::flagged(
                                Stage::Normalize,
                                table,
                                row.line,
                                flag,
                                format!("{} = '{}'", column, normalized.value),
                            );
                            diagnostic.key = row_key(key_idx, &row);
                            diagnostics.push(diagnostic);
                        }
                        fields[idx] = normalized.value;
                    }
                    Err(reason) => {
                        debug!(table = table.name(), line = row.line, column, "record excluded");
                        let mut diagnostic = Diagnostic::excluded(
                            Stage::Normalize,
                            table,
                            row.line,
                            reason,
                            format!("{} = '{}'", column, value),
                        );
                        diagnostic.key = row_key(key_idx, &row);
                        diagnostics.push(diagnostic);
                        continue 'rows;
                    }
                }
            }

            rows.push(RawRow {
                line: row.line,
                record: StringRecord::from(fields),
            });
        }

        (
            RawTable {
                table,
                headers: raw.headers,
                rows,
            },
            diagnostics,
        )
    }

    /// Clients carry their region inside the address; add a `uf` column when absent
    fn fill_client_regions(&self, raw: RawTable) -> RawTable {
        if raw.column_index("uf").is_some() {
            return raw;
        }
        let Some(address_idx) = raw.column_index("endereco") else {
            return raw;
        };

        let mut headers = raw.headers.clone();
        headers.push_field("uf");

        let rows = raw
            .rows
            .into_iter()
            .map(|row| {
                let region = row
                    .record
                    .get(address_idx)
                    .and_then(|address| self.extract_region(address))
                    .unwrap_or_default();
                let mut record = row.record;
                record.push_field(&region);
                RawRow {
                    line: row.line,
                    record,
                }
            })
            .collect();

        RawTable {
            table: raw.table,
            headers,
            rows,
        }
    }

    /// Pull a 2-letter region out of a free-text address
    pub fn extract_region(&self, address: &str) -> Option<String> {
        let address = address.trim();
        self.address_region_patterns.iter().find_map(|pattern| {
            pattern
                .captures(address)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_uppercase())
        })
    }
}

/// "... / RS", "RS 90000-000", "... RS"
fn address_region_patterns() -> Vec<Regex> {
    [
        r"/\s*([A-Z]{2})\b",
        r"\b([A-Z]{2})\s*\d{5}-?\d{3}$",
        r"\b([A-Z]{2})\s*$",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> FieldNormalizer {
        FieldNormalizer::new(&TransformConfig::default())
    }

    #[test]
    fn test_region_code_map_synonyms() {
        let n = normalizer();
        assert_eq!(n.regions().lookup(" sp "), RegionLookup::Mapped("SP".to_string()));
        assert_eq!(n.regions().lookup("São Paulo"), RegionLookup::Mapped("SP".to_string()));
        assert_eq!(n.regions().lookup("sao  paulo"), RegionLookup::Mapped("SP".to_string()));
        assert_eq!(
            n.regions().lookup("Rio Grande do Sul"),
            RegionLookup::Mapped("RS".to_string())
        );
        assert_eq!(n.regions().lookup("xx"), RegionLookup::Unmapped("XX".to_string()));
    }

    #[test]
    fn test_region_normalization_idempotent() {
        let n = normalizer();
        let inputs = ["sp", "Paraná", "  minas gerais", "zz", "DF", "espirito santo"];

        let once: Vec<String> = inputs
            .iter()
            .map(|v| n.regions().lookup(v).code().to_string())
            .collect();
        let twice: Vec<String> = once
            .iter()
            .map(|v| n.regions().lookup(v).code().to_string())
            .collect();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_custom_region_map_is_idempotent() {
        let mut entries = BTreeMap::new();
        entries.insert("Capital".to_string(), "cp".to_string());
        let map = RegionCodeMap::new(&entries);

        assert_eq!(map.lookup("capital"), RegionLookup::Mapped("CP".to_string()));
        assert_eq!(map.lookup("CP"), RegionLookup::Mapped("CP".to_string()));
    }

    #[test]
    fn test_date_parse_priority() {
        let n = normalizer();
        // Day-first wins over month-first
        let v = n.normalize_value(ColumnRule::DateParse, "01/02/2020").unwrap();
        assert_eq!(v.value, "2020-02-01");

        let v = n.normalize_value(ColumnRule::DateParse, "2020-02-01").unwrap();
        assert_eq!(v.value, "2020-02-01");

        // Only the month-first format accepts this one
        let v = n.normalize_value(ColumnRule::DateParse, "12/31/2020").unwrap();
        assert_eq!(v.value, "2020-12-31");

        // Timestamp input truncated to date
        let v = n
            .normalize_value(ColumnRule::DateParse, "2020-02-01 10:11:12 UTC")
            .unwrap();
        assert_eq!(v.value, "2020-02-01");

        assert_eq!(
            n.normalize_value(ColumnRule::DateParse, "31/31/2020"),
            Err(ReasonCode::InvalidDate)
        );
    }

    #[test]
    fn test_timestamp_parse() {
        let n = normalizer();
        let v = n
            .normalize_value(ColumnRule::TimestampParse, "2021-03-04 05:06:07.250 UTC")
            .unwrap();
        assert_eq!(v.value, "2021-03-04T05:06:07.250");

        let v = n
            .normalize_value(ColumnRule::TimestampParse, "2021-03-04 05:06:07 UTC")
            .unwrap();
        assert_eq!(v.value, "2021-03-04T05:06:07");

        let v = n.normalize_value(ColumnRule::TimestampParse, "04/03/2021").unwrap();
        assert_eq!(v.value, "2021-03-04T00:00:00");

        // Canonical output parses again
        let again = n.normalize_value(ColumnRule::TimestampParse, &v.value).unwrap();
        assert_eq!(again.value, v.value);

        assert!(n.normalize_value(ColumnRule::TimestampParse, "ontem").is_err());
    }

    #[test]
    fn test_numeric_coerce() {
        assert_eq!(coerce_number("1234.56"), Some(1234.56));
        assert_eq!(coerce_number("1.234,56"), Some(1234.56));
        assert_eq!(coerce_number("1,234.56"), Some(1234.56));
        assert_eq!(coerce_number("R$ 10,50"), Some(10.5));
        assert_eq!(coerce_number("-45.99"), Some(-45.99));
        assert_eq!(coerce_number("abc"), None);
        assert_eq!(coerce_number("inf"), None);

        let n = normalizer();
        assert_eq!(n.normalize_value(ColumnRule::NumericCoerce, "12.0").unwrap().value, "12");
    }

    #[test]
    fn test_thousands_grouping() {
        assert_eq!(coerce_number("1,234,567"), Some(1234567.0));
        assert_eq!(coerce_number("1.234.567"), Some(1234567.0));
        assert_eq!(coerce_number("-12,345,678"), Some(-12345678.0));
        // A single comma stays a decimal comma
        assert_eq!(coerce_number("1,234"), Some(1.234));
        assert_eq!(coerce_number("1,23,4"), None);
        assert_eq!(coerce_number("1.2.3"), None);
    }

    #[test]
    fn test_identifiers_stay_exact() {
        let n = normalizer();
        let a = n
            .normalize_value(ColumnRule::IdentifierCoerce, "9007199254740993")
            .unwrap();
        let b = n
            .normalize_value(ColumnRule::IdentifierCoerce, "9007199254740992")
            .unwrap();
        assert_eq!(a.value, "9007199254740993");
        assert_ne!(a.value, b.value);

        assert_eq!(coerce_identifier(" 42 "), Some(42));
        assert_eq!(coerce_identifier("42.0"), Some(42));
        assert_eq!(coerce_identifier("42.5"), None);
        assert_eq!(coerce_identifier("1e3"), None);
        assert_eq!(
            n.normalize_value(ColumnRule::IdentifierCoerce, "abc"),
            Err(ReasonCode::InvalidNumber)
        );
    }

    #[test]
    fn test_empty_cells_stay_empty() {
        let n = normalizer();
        for rule in [
            ColumnRule::DateParse,
            ColumnRule::IdentifierCoerce,
            ColumnRule::NumericCoerce,
            ColumnRule::RegionCodeMap,
        ] {
            let v = n.normalize_value(rule, "   ").unwrap();
            assert_eq!(v.value, "");
            assert_eq!(v.flag, None);
        }
    }

    #[test]
    fn test_normalize_table_excludes_and_flags() {
        let n = normalizer();
        let raw = RawTable::parse(
            SourceTable::Branches,
            "cod_agencia,nome,uf,data_abertura\n\
             1, Centro ,são paulo,01/02/2010\n\
             2,Sul,XX,2011-05-06\n\
             3,Norte,RJ,not-a-date\n",
            b',',
        )
        .unwrap();

        let (table, diagnostics) = n.normalize_table(raw);

        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].record.get(1), Some("Centro"));
        assert_eq!(table.rows[0].record.get(2), Some("SP"));
        assert_eq!(table.rows[0].record.get(3), Some("2010-02-01"));
        assert_eq!(table.rows[1].record.get(2), Some("XX"));

        assert_eq!(diagnostics.len(), 2);
        let flagged = diagnostics.iter().find(|d| !d.is_exclusion()).unwrap();
        assert_eq!(flagged.reason, ReasonCode::UnmappedRegionCode);
        assert_eq!(flagged.line, 3);
        let excluded = diagnostics.iter().find(|d| d.is_exclusion()).unwrap();
        assert_eq!(excluded.reason, ReasonCode::InvalidDate);
        assert_eq!(excluded.line, 4);
    }

    #[test]
    fn test_client_region_from_address() {
        let n = normalizer();
        assert_eq!(
            n.extract_region("Rua A, 100 - Centro, Porto Alegre / RS"),
            Some("RS".to_string())
        );
        assert_eq!(
            n.extract_region("Av. Brasil 500, Curitiba PR 80000-000"),
            Some("PR".to_string())
        );
        assert_eq!(n.extract_region("Rua B, Recife PE"), Some("PE".to_string()));
        assert_eq!(n.extract_region("sem estado"), None);

        let raw = RawTable::parse(
            SourceTable::Clients,
            "cod_cliente,primeiro_nome,data_nascimento,endereco\n\
             1,Ana,15/01/1990,\"Rua A, 10 / sp\"\n\
             2,Bia,15/01/1991,\"Rua B, Recife PE\"\n",
            b',',
        )
        .unwrap();

        let (table, _) = n.normalize_table(raw);
        let uf = table.column_index("uf").unwrap();
        // Lowercase codes do not match the address patterns
        assert_eq!(table.rows[0].record.get(uf), Some(""));
        assert_eq!(table.rows[1].record.get(uf), Some("PE"));
    }
}
