// ⚙️ Transform configuration
// Every mapping the transform relies on lives here and is passed in explicitly.

use crate::error::{PipelineError, Result};
use crate::rules::{default_category_rules, CategoryRule};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// JOIN POLICY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    /// Missing right-hand record rejects the row
    Inner,
    /// Missing right-hand record yields null attributes
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinPolicy {
    pub account_client: JoinType,
    pub account_branch: JoinType,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        JoinPolicy {
            account_client: JoinType::Left,
            account_branch: JoinType::Inner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgeBounds {
    pub min: i32,
    pub max: i32,
}

impl Default for AgeBounds {
    fn default() -> Self {
        AgeBounds { min: 0, max: 130 }
    }
}

// ============================================================================
// SOURCE / SINK OPTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOptions {
    pub delimiter: char,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions { delimiter: ',' }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputEncoding {
    #[serde(alias = "utf8")]
    Utf8,
    #[serde(alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkOptions {
    pub delimiter: char,
    pub encoding: OutputEncoding,
    pub header: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        SinkOptions {
            delimiter: ',',
            encoding: OutputEncoding::Utf8,
            header: true,
        }
    }
}

/// Delimiters must fit in a single byte for the csv crate
pub fn delimiter_byte(delimiter: char) -> Result<u8> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        Err(PipelineError::Config(format!(
            "delimiter {:?} is not a single-byte ASCII character",
            delimiter
        )))
    }
}

// ============================================================================
// TRANSFORM CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Variant spelling (any case) → 2-letter region code
    pub region_code_map: BTreeMap<String, String>,

    /// Region code → display name
    pub region_names: BTreeMap<String, String>,

    /// Accepted date formats, in priority order
    pub date_formats: Vec<String>,

    /// Accepted timestamp formats, in priority order
    pub timestamp_formats: Vec<String>,

    pub join_policy: JoinPolicy,
    pub age_bounds: AgeBounds,

    /// Reference date for "today"-relative derivations (defaults to the run date)
    pub processing_date: Option<NaiveDate>,

    /// Absolute bound used for the clipped amount column
    pub amount_clip: f64,

    pub account_type_labels: BTreeMap<String, String>,
    pub client_type_labels: BTreeMap<String, String>,

    /// Proposal status counted as an approval
    pub approved_status: String,

    pub category_rules: Vec<CategoryRule>,

    pub source: SourceOptions,
    pub sink: SinkOptions,
}

impl TransformConfig {
    /// Load configuration from a TOML file; missing keys fall back to defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: TransformConfig =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the transform cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.date_formats.is_empty() {
            return Err(PipelineError::Config("date_formats must not be empty".to_string()));
        }
        if self.timestamp_formats.is_empty() {
            return Err(PipelineError::Config(
                "timestamp_formats must not be empty".to_string(),
            ));
        }
        if self.age_bounds.min > self.age_bounds.max {
            return Err(PipelineError::Config(format!(
                "age_bounds.min ({}) is greater than age_bounds.max ({})",
                self.age_bounds.min, self.age_bounds.max
            )));
        }
        if !(self.amount_clip.is_finite() && self.amount_clip > 0.0) {
            return Err(PipelineError::Config(format!(
                "amount_clip must be a positive number, got {}",
                self.amount_clip
            )));
        }
        for (variant, code) in &self.region_code_map {
            if code.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "region_code_map entry '{}' maps to an empty code",
                    variant
                )));
            }
        }
        delimiter_byte(self.source.delimiter)?;
        delimiter_byte(self.sink.delimiter)?;
        Ok(())
    }

    pub fn processing_date(&self) -> NaiveDate {
        self.processing_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        let region_names = default_region_names();

        TransformConfig {
            region_code_map: default_region_code_map(&region_names),
            region_names,
            date_formats: vec![
                "%d/%m/%Y".to_string(),
                "%Y-%m-%d".to_string(),
                "%m/%d/%Y".to_string(),
            ],
            timestamp_formats: vec![
                "%Y-%m-%d %H:%M:%S%.f UTC".to_string(),
                "%Y-%m-%d %H:%M:%S%.f".to_string(),
                "%Y-%m-%dT%H:%M:%S%.f".to_string(),
                "%d/%m/%Y %H:%M:%S".to_string(),
                "%d/%m/%Y %H:%M".to_string(),
            ],
            join_policy: JoinPolicy::default(),
            age_bounds: AgeBounds::default(),
            processing_date: None,
            amount_clip: 1_000_000.0,
            account_type_labels: labels(&[("PF", "Pessoa Física"), ("PJ", "Pessoa Jurídica")]),
            client_type_labels: labels(&[("PF", "Pessoa Física"), ("PJ", "Pessoa Jurídica")]),
            approved_status: "Aprovada".to_string(),
            category_rules: default_category_rules(),
            source: SourceOptions::default(),
            sink: SinkOptions::default(),
        }
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ============================================================================
// REGION DEFAULTS (Brazilian federative units)
// ============================================================================

fn default_region_names() -> BTreeMap<String, String> {
    labels(&[
        ("AC", "Acre"),
        ("AL", "Alagoas"),
        ("AP", "Amapá"),
        ("AM", "Amazonas"),
        ("BA", "Bahia"),
        ("CE", "Ceará"),
        ("DF", "Distrito Federal"),
        ("ES", "Espírito Santo"),
        ("GO", "Goiás"),
        ("MA", "Maranhão"),
        ("MT", "Mato Grosso"),
        ("MS", "Mato Grosso do Sul"),
        ("MG", "Minas Gerais"),
        ("PA", "Pará"),
        ("PB", "Paraíba"),
        ("PR", "Paraná"),
        ("PE", "Pernambuco"),
        ("PI", "Piauí"),
        ("RJ", "Rio de Janeiro"),
        ("RN", "Rio Grande do Norte"),
        ("RS", "Rio Grande do Sul"),
        ("RO", "Rondônia"),
        ("RR", "Roraima"),
        ("SC", "Santa Catarina"),
        ("SP", "São Paulo"),
        ("SE", "Sergipe"),
        ("TO", "Tocantins"),
    ])
}

/// Each code maps to itself, plus the state name with and without accents
fn default_region_code_map(names: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (code, name) in names {
        map.insert(code.clone(), code.clone());
        map.insert(name.to_uppercase(), code.clone());
        map.insert(strip_accents(&name.to_uppercase()), code.clone());
    }
    map
}

pub(crate) fn strip_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'Ç' => 'C',
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TransformConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.region_names.len(), 27);
        assert_eq!(config.join_policy.account_client, JoinType::Left);
        assert_eq!(config.join_policy.account_branch, JoinType::Inner);
        assert_eq!(config.age_bounds, AgeBounds { min: 0, max: 130 });
    }

    #[test]
    fn test_default_region_map_contains_variants() {
        let config = TransformConfig::default();
        assert_eq!(config.region_code_map.get("SP"), Some(&"SP".to_string()));
        assert_eq!(config.region_code_map.get("SÃO PAULO"), Some(&"SP".to_string()));
        assert_eq!(config.region_code_map.get("SAO PAULO"), Some(&"SP".to_string()));
        assert_eq!(config.region_code_map.get("PARANA"), Some(&"PR".to_string()));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TransformConfig::from_toml(
            r#"
            processing_date = "2024-06-30"
            date_formats = ["%Y-%m-%d"]

            [join_policy]
            account_client = "inner"

            [age_bounds]
            max = 120

            [sink]
            delimiter = ";"
            encoding = "latin-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.processing_date(), NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
        assert_eq!(config.date_formats, vec!["%Y-%m-%d".to_string()]);
        assert_eq!(config.join_policy.account_client, JoinType::Inner);
        assert_eq!(config.join_policy.account_branch, JoinType::Inner);
        assert_eq!(config.age_bounds.min, 0);
        assert_eq!(config.age_bounds.max, 120);
        assert_eq!(config.sink.delimiter, ';');
        assert_eq!(config.sink.encoding, OutputEncoding::Latin1);
        assert!(config.sink.header);
        assert!(!config.category_rules.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = TransformConfig::from_toml("date_formats = []").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let err = TransformConfig::from_toml("[age_bounds]\nmin = 10\nmax = 5").unwrap_err();
        assert!(err.to_string().contains("age_bounds"));

        let err = TransformConfig::from_toml("[sink]\ndelimiter = \"§\"").unwrap_err();
        assert!(err.to_string().contains("delimiter"));
    }

    #[test]
    fn test_strip_accents() {
        assert_eq!(strip_accents("ESPÍRITO SANTO"), "ESPIRITO SANTO");
        assert_eq!(strip_accents("Goiás"), "Goias");
    }
}
