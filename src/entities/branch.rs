// 🏦 Branch Entity

use super::{Keyed, Record};
use crate::source::SourceTable;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(rename = "cod_agencia")]
    pub id: i64,

    #[serde(rename = "nome")]
    pub name: String,

    #[serde(rename = "endereco", default)]
    pub address: Option<String>,

    #[serde(rename = "cidade", default)]
    pub city: Option<String>,

    /// Region code, already mapped by the normalizer
    #[serde(rename = "uf")]
    pub region: String,

    #[serde(rename = "data_abertura", default)]
    pub opened_on: Option<NaiveDate>,

    #[serde(rename = "tipo_agencia", default)]
    pub branch_type: Option<String>,

    #[serde(skip)]
    pub line: u64,
}

impl Record for Branch {
    const TABLE: SourceTable = SourceTable::Branches;

    fn line(&self) -> u64 {
        self.line
    }

    fn set_line(&mut self, line: u64) {
        self.line = line;
    }

    fn missing_field(&self) -> Option<&'static str> {
        if self.name.is_empty() {
            Some("nome")
        } else if self.region.is_empty() {
            Some("uf")
        } else {
            None
        }
    }
}

impl Keyed for Branch {
    fn key(&self) -> i64 {
        self.id
    }
}
