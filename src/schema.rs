//! The hospital schema the middleware is allowed to serve.

use std::{collections::BTreeSet, fmt};

/// Subject-id column assumed for tables the schema does not describe
pub const FALLBACK_SUBJECT_ID: &str = "patient_id";
/// The table holding principals and their budgets
pub const STAFF_TABLE: &str = "staffs";
/// How principals are identified in the staff table
pub const PRINCIPAL_COLUMN: &str = "national_id";
/// The durable budget column of the staff table
pub const BUDGET_COLUMN: &str = "privacy_budget";

/// A table with the column identifying the individual each row is about
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Table {
    name: String,
    subject_id: String,
    columns: Vec<String>,
}

impl Table {
    pub fn new(name: &str, subject_id: &str, columns: &[&str]) -> Self {
        Table {
            name: name.to_string(),
            subject_id: subject_id.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.columns.join(", "))
    }
}

/// Tables, sensitive attributes and integer columns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    tables: Vec<Table>,
    sensitive: BTreeSet<String>,
    integers: BTreeSet<String>,
}

impl Schema {
    pub fn new(tables: Vec<Table>, sensitive: &[&str], integers: &[&str]) -> Self {
        Schema {
            tables,
            sensitive: sensitive.iter().map(|c| c.to_string()).collect(),
            integers: integers.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// The fixed hospital schema
    pub fn hospital() -> Self {
        Schema::new(
            vec![
                Table::new(
                    STAFF_TABLE,
                    "staff_id",
                    &[
                        "staff_id",
                        "role",
                        "national_id",
                        "full_name",
                        "dob",
                        "age",
                        "gender",
                        "address",
                        "specialization",
                        "privacy_budget",
                    ],
                ),
                Table::new(
                    "patients",
                    "patient_id",
                    &[
                        "patient_id",
                        "national_id",
                        "full_name",
                        "dob",
                        "age",
                        "gender",
                        "address",
                    ],
                ),
                Table::new(
                    "diagnoses",
                    "patient_id",
                    &[
                        "diagnosis_id",
                        "patient_id",
                        "staff_id",
                        "disease_name",
                        "visit_date",
                    ],
                ),
            ],
            &["age", "privacy_budget"],
            &["age", "patient_id", "staff_id", "diagnosis_id"],
        )
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// The subject-id column of a table, `patient_id` when the table is unknown
    pub fn subject_id(&self, table: &str) -> &str {
        self.table(table)
            .map(Table::subject_id)
            .unwrap_or(FALLBACK_SUBJECT_ID)
    }

    /// Attributes whose comparisons are generalized
    pub fn is_sensitive(&self, column: &str) -> bool {
        self.sensitive.contains(&column.to_lowercase())
    }

    /// Columns whose aggregates are released as integers
    pub fn is_integer(&self, column: &str) -> bool {
        self.integers.contains(&column.to_lowercase())
    }
}

impl Default for Schema {
    fn default() -> Self {
        Schema::hospital()
    }
}
