// 👤 Client Entity
// Demographic source for the enriched transaction view.

use super::{full_name, Keyed, Record};
use crate::report::ReasonCode;
use crate::source::SourceTable;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    #[serde(rename = "cod_cliente")]
    pub id: i64,

    #[serde(rename = "primeiro_nome")]
    pub first_name: String,

    #[serde(rename = "ultimo_nome", default)]
    pub last_name: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    /// PF / PJ
    #[serde(rename = "tipo_cliente", default)]
    pub client_type: Option<String>,

    #[serde(rename = "data_inclusao", default)]
    pub registered_at: Option<NaiveDateTime>,

    #[serde(rename = "cpfcnpj", default)]
    pub tax_id: Option<String>,

    #[serde(rename = "data_nascimento", default)]
    pub birth_date: Option<NaiveDate>,

    #[serde(rename = "endereco", default)]
    pub address: Option<String>,

    #[serde(rename = "cep", default)]
    pub postal_code: Option<String>,

    /// Region code taken from the source or extracted from the address
    #[serde(rename = "uf", default)]
    pub region: Option<String>,

    #[serde(skip)]
    pub line: u64,
}

impl Client {
    pub fn full_name(&self) -> String {
        full_name(&self.first_name, self.last_name.as_deref())
    }

    /// Birth date must not be after the processing date
    pub fn born_after(&self, date: NaiveDate) -> bool {
        self.birth_date.map(|birth| birth > date).unwrap_or(false)
    }
}

impl Record for Client {
    const TABLE: SourceTable = SourceTable::Clients;

    fn line(&self) -> u64 {
        self.line
    }

    fn set_line(&mut self, line: u64) {
        self.line = line;
    }

    fn missing_field(&self) -> Option<&'static str> {
        if self.first_name.is_empty() {
            Some("primeiro_nome")
        } else {
            None
        }
    }

    fn record_key(&self) -> Option<String> {
        Some(self.id.to_string())
    }

    fn screen(&self, processing_date: NaiveDate) -> Option<(ReasonCode, String)> {
        if self.born_after(processing_date) {
            let birth = self.birth_date.map(|d| d.to_string()).unwrap_or_default();
            Some((
                ReasonCode::BirthDateInFuture,
                format!("data_nascimento {} is after {}", birth, processing_date),
            ))
        } else {
            None
        }
    }
}

impl Keyed for Client {
    fn key(&self) -> i64 {
        self.id
    }
}
