// 🧑‍💼 Employee Entity + Branch assignment link

use super::{full_name, Keyed, Record};
use crate::source::SourceTable;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    #[serde(rename = "cod_colaborador")]
    pub id: i64,

    #[serde(rename = "primeiro_nome")]
    pub first_name: String,

    #[serde(rename = "ultimo_nome", default)]
    pub last_name: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(rename = "cpf", default)]
    pub tax_id: Option<String>,

    #[serde(rename = "data_nascimento", default)]
    pub birth_date: Option<NaiveDate>,

    #[serde(rename = "endereco", default)]
    pub address: Option<String>,

    #[serde(rename = "cep", default)]
    pub postal_code: Option<String>,

    #[serde(skip)]
    pub line: u64,
}

impl Employee {
    pub fn full_name(&self) -> String {
        full_name(&self.first_name, self.last_name.as_deref())
    }
}

impl Record for Employee {
    const TABLE: SourceTable = SourceTable::Employees;

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
}

impl Keyed for Employee {
    fn key(&self) -> i64 {
        self.id
    }
}

/// Employee ↔ Branch association; may repeat per employee in the source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchEmployeeLink {
    #[serde(rename = "cod_colaborador")]
    pub employee_id: i64,

    #[serde(rename = "cod_agencia")]
    pub branch_id: i64,

    /// Effective date of the assignment (absent = oldest)
    #[serde(rename = "data_inicio", default)]
    pub effective_from: Option<NaiveDate>,

    #[serde(skip)]
    pub line: u64,
}

impl Record for BranchEmployeeLink {
    const TABLE: SourceTable = SourceTable::BranchEmployeeLinks;

    fn line(&self) -> u64 {
        self.line
    }

    fn set_line(&mut self, line: u64) {
        self.line = line;
    }
}
