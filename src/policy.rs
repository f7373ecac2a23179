//! Role policies and the directory resolving principals to roles.

use crate::{
    io::{self, Store, Value},
    schema::{PRINCIPAL_COLUMN, STAFF_TABLE},
};
use std::{collections::BTreeSet, error, fmt, result, sync::Arc};

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Directory(String),
    Other(String),
}

impl Error {
    pub fn directory(desc: impl fmt::Display) -> Error {
        Error::Directory(format!("Cannot resolve the principal: {}", desc))
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Directory(desc) => writeln!(f, "Directory: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::directory(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Job specialization that turns an employee into an accounting user
const ACCOUNTANT: &str = "Accountant";

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Role {
    Doctor,
    Researcher,
    Manager,
    Accounting,
    Employee,
    Restricted,
}

impl Role {
    /// Resolve a staff role and specialization, anything unknown is `Restricted`
    pub fn from_directory(role: &str, specialization: Option<&str>) -> Role {
        match role.trim().to_lowercase().as_str() {
            "doctor" => Role::Doctor,
            "researcher" => Role::Researcher,
            "manager" => Role::Manager,
            "accounting" => Role::Accounting,
            "employee" if specialization.map(str::trim) == Some(ACCOUNTANT) => Role::Accounting,
            "employee" => Role::Employee,
            _ => Role::Restricted,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Doctor => "doctor",
            Role::Researcher => "researcher",
            Role::Manager => "manager",
            Role::Accounting => "accounting",
            Role::Employee => "employee",
            Role::Restricted => "restricted",
        }
    }

    /// The built-in policy of the role
    pub fn policy(&self) -> RolePolicy {
        const IDENTIFYING: [&str; 3] = ["national_id", "full_name", "address"];
        const IDENTIFYING_AND_DOB: [&str; 4] = ["national_id", "full_name", "address", "dob"];
        match self {
            Role::Doctor => RolePolicy::new(*self, &["patients", "diagnoses"], &IDENTIFYING, true),
            Role::Researcher => {
                RolePolicy::new(*self, &["patients", "diagnoses"], &IDENTIFYING_AND_DOB, true)
            }
            Role::Manager => RolePolicy::new(
                *self,
                &[STAFF_TABLE, "patients", "diagnoses"],
                &IDENTIFYING,
                true,
            ),
            Role::Accounting => {
                RolePolicy::new(*self, &[STAFF_TABLE], &IDENTIFYING_AND_DOB, false)
            }
            Role::Employee | Role::Restricted => RolePolicy::new(*self, &[], &[], false),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a role may read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolePolicy {
    role: Role,
    allowed_tables: BTreeSet<String>,
    blocked_attributes: BTreeSet<String>,
    predicates_allowed: bool,
}

impl RolePolicy {
    pub fn new(
        role: Role,
        allowed_tables: &[&str],
        blocked_attributes: &[&str],
        predicates_allowed: bool,
    ) -> Self {
        RolePolicy {
            role,
            allowed_tables: allowed_tables.iter().map(|t| t.to_string()).collect(),
            blocked_attributes: blocked_attributes.iter().map(|a| a.to_string()).collect(),
            predicates_allowed,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn allows_table(&self, table: &str) -> bool {
        self.allowed_tables.contains(&table.to_lowercase())
    }

    pub fn blocks(&self, attribute: &str) -> bool {
        self.blocked_attributes.contains(&attribute.to_lowercase())
    }

    pub fn predicates_allowed(&self) -> bool {
        self.predicates_allowed
    }

    pub fn allowed_tables(&self) -> impl Iterator<Item = &str> {
        self.allowed_tables.iter().map(String::as_str)
    }
}

impl From<Role> for RolePolicy {
    fn from(role: Role) -> Self {
        role.policy()
    }
}

/// Resolves principals through the staff table
#[derive(Clone)]
pub struct Directory {
    store: Arc<dyn Store>,
}

impl Directory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Directory { store }
    }

    /// The role of a principal, `Restricted` when the principal is unknown
    pub fn lookup(&self, principal: &str) -> Result<Role> {
        let rows = self.store.execute(
            &format!(
                "SELECT role, specialization FROM {STAFF_TABLE} WHERE {PRINCIPAL_COLUMN} = ?1"
            ),
            &[Value::text(principal)],
        )?;
        let role = match rows.first() {
            Some(row) => match row.get("role").and_then(Value::as_str) {
                Some(role) => {
                    Role::from_directory(role, row.get("specialization").and_then(Value::as_str))
                }
                None => Role::Restricted,
            },
            None => Role::Restricted,
        };
        log::debug!("Principal resolved to the {role} role");
        Ok(role)
    }
}
