// 📝 Credit Proposal Entity

use super::{Keyed, Record};
use crate::source::SourceTable;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditProposal {
    #[serde(rename = "cod_proposta")]
    pub id: i64,

    #[serde(rename = "cod_cliente", default)]
    pub client_id: Option<i64>,

    #[serde(rename = "cod_colaborador", default)]
    pub employee_id: Option<i64>,

    #[serde(rename = "data_entrada_proposta")]
    pub submitted_at: NaiveDateTime,

    #[serde(rename = "taxa_juros_mensal", default)]
    pub monthly_rate: Option<f64>,

    #[serde(rename = "valor_proposta")]
    pub amount: f64,

    #[serde(rename = "valor_financiamento", default)]
    pub financed_amount: Option<f64>,

    #[serde(rename = "valor_entrada", default)]
    pub down_payment: Option<f64>,

    #[serde(rename = "valor_prestacao", default)]
    pub installment_amount: Option<f64>,

    #[serde(rename = "quantidade_parcelas", default)]
    pub installments: Option<i64>,

    #[serde(rename = "carencia", default)]
    pub grace_period: Option<i64>,

    #[serde(rename = "status_proposta")]
    pub status: String,

    #[serde(skip)]
    pub line: u64,
}

impl CreditProposal {
    pub fn is_approved(&self, approved_status: &str) -> bool {
        self.status.eq_ignore_ascii_case(approved_status)
    }
}

impl Record for CreditProposal {
    const TABLE: SourceTable = SourceTable::CreditProposals;

    fn line(&self) -> u64 {
        self.line
    }

    fn set_line(&mut self, line: u64) {
        self.line = line;
    }

    fn missing_field(&self) -> Option<&'static str> {
        if self.status.is_empty() {
            Some("status_proposta")
        } else {
            None
        }
    }
}

impl Keyed for CreditProposal {
    fn key(&self) -> i64 {
        self.id
    }
}
