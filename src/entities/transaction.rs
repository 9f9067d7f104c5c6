// 💸 Transaction Entity - the row the whole transform is anchored on

use super::{Keyed, Record};
use crate::source::SourceTable;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "cod_transacao")]
    pub id: i64,

    #[serde(rename = "num_conta")]
    pub account_id: i64,

    #[serde(rename = "data_transacao")]
    pub timestamp: NaiveDateTime,

    #[serde(rename = "nome_transacao")]
    pub description: String,

    #[serde(rename = "valor_transacao")]
    pub amount: f64,

    /// Source category, if the export has one
    #[serde(rename = "categoria", default)]
    pub category: Option<String>,

    #[serde(skip)]
    pub line: u64,
}

impl Record for Transaction {
    const TABLE: SourceTable = SourceTable::Transactions;

    fn line(&self) -> u64 {
        self.line
    }

    fn set_line(&mut self, line: u64) {
        self.line = line;
    }

    fn missing_field(&self) -> Option<&'static str> {
        if self.description.is_empty() {
            Some("nome_transacao")
        } else {
            None
        }
    }
}

impl Keyed for Transaction {
    fn key(&self) -> i64 {
        self.id
    }
}
