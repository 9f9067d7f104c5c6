// 💳 Account Entity - ties a client to a branch
//
// Both references are nullable at decode time; the joiner decides what a
// missing reference means under the configured join policy.

use super::{Keyed, Record};
use crate::source::SourceTable;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "num_conta")]
    pub id: i64,

    #[serde(rename = "cod_cliente")]
    pub client_id: Option<i64>,

    #[serde(rename = "cod_agencia")]
    pub branch_id: Option<i64>,

    /// Servicing employee
    #[serde(rename = "cod_colaborador", default)]
    pub employee_id: Option<i64>,

    /// PF / PJ
    #[serde(rename = "tipo_conta")]
    pub account_type: String,

    #[serde(rename = "data_abertura")]
    pub opened_at: NaiveDateTime,

    #[serde(rename = "saldo_total", default)]
    pub total_balance: Option<f64>,

    #[serde(rename = "saldo_disponivel", default)]
    pub available_balance: Option<f64>,

    #[serde(rename = "data_ultimo_lancamento", default)]
    pub last_activity_at: Option<NaiveDateTime>,

    #[serde(skip)]
    pub line: u64,
}

impl Account {
    pub fn opened_on(&self) -> NaiveDate {
        self.opened_at.date()
    }
}

impl Record for Account {
    const TABLE: SourceTable = SourceTable::Accounts;

    fn line(&self) -> u64 {
        self.line
    }

    fn set_line(&mut self, line: u64) {
        self.line = line;
    }

    fn missing_field(&self) -> Option<&'static str> {
        if self.account_type.is_empty() {
            Some("tipo_conta")
        } else {
            None
        }
    }
}

impl Keyed for Account {
    fn key(&self) -> i64 {
        self.id
    }
}
