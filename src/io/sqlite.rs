use super::{Error, Result, Row, Store, Value};
use chrono::{Datelike, NaiveDate};
use rusqlite::{
    self, params, params_from_iter,
    types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
    Connection,
};
use std::{path::Path, sync::Mutex};

/// Ages in the fixture are computed at this date
const REFERENCE_DATE: (i32, u32, u32) = (2026, 1, 1);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS staffs (
    staff_id INTEGER PRIMARY KEY,
    role TEXT NOT NULL,
    national_id TEXT NOT NULL UNIQUE,
    full_name TEXT,
    dob TEXT,
    age INTEGER,
    gender TEXT,
    address TEXT,
    specialization TEXT,
    privacy_budget REAL NOT NULL DEFAULT 10.0
);
CREATE TABLE IF NOT EXISTS patients (
    patient_id INTEGER PRIMARY KEY,
    national_id TEXT NOT NULL UNIQUE,
    full_name TEXT,
    dob TEXT,
    age INTEGER,
    gender TEXT,
    address TEXT
);
CREATE TABLE IF NOT EXISTS diagnoses (
    diagnosis_id INTEGER PRIMARY KEY,
    patient_id INTEGER REFERENCES patients(patient_id),
    staff_id INTEGER REFERENCES staffs(staff_id),
    disease_name TEXT,
    visit_date TEXT
);
";

/// Converts sqlite errors to store errors
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::database(err)
    }
}

/// A store backed by a single SQLite connection.
/// Every round trip of a request goes through the same connection.
#[derive(Debug)]
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-backed store, creating the hospital schema if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = SqliteStore {
            connection: Mutex::new(Connection::open(path)?),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// An in-memory store, gone with the process
    pub fn in_memory() -> Result<Self> {
        let store = SqliteStore {
            connection: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        let connection = self.connection.lock().map_err(|err| Error::lock(err))?;
        connection.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Insert the hospital fixture: 9 staffs, 70 patients in four age groups and their diagnoses
    pub fn seed_fixture(&self) -> Result<()> {
        let mut connection = self.connection.lock().map_err(|err| Error::lock(err))?;
        let transaction = connection.transaction()?;
        for (staff_id, role, national_id, full_name, dob, gender, address, specialization, budget) in STAFFS {
            transaction.execute(
                "INSERT INTO staffs (staff_id, role, national_id, full_name, dob, age, gender, address, specialization, privacy_budget) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![staff_id, role, national_id, full_name, dob, age(dob)?, gender, address, specialization, budget],
            )?;
        }
        for patient in patients() {
            transaction.execute(
                "INSERT INTO patients (patient_id, national_id, full_name, dob, age, gender, address) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    patient.id,
                    patient.national_id,
                    patient.full_name,
                    patient.dob,
                    age(&patient.dob)?,
                    patient.gender,
                    patient.address
                ],
            )?;
        }
        for (diagnosis_id, patient_id, staff_id, disease_name, visit_date) in diagnoses() {
            transaction.execute(
                "INSERT INTO diagnoses (diagnosis_id, patient_id, staff_id, disease_name, visit_date) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![diagnosis_id, patient_id, staff_id, disease_name, visit_date],
            )?;
        }
        transaction.commit()?;
        log::debug!("Hospital fixture seeded");
        Ok(())
    }
}

impl Store for SqliteStore {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let connection = self.connection.lock().map_err(|err| Error::lock(err))?;
        let mut statement = connection.prepare(sql)?;
        if statement.column_count() == 0 {
            statement.execute(params_from_iter(params.iter()))?;
            return Ok(vec![]);
        }
        let names: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let rows = statement
            .query_map(params_from_iter(params.iter()), |row| {
                names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| Ok((name.clone(), row.get::<_, Value>(i)?)))
                    .collect::<rusqlite::Result<Row>>()
            })?
            .collect::<rusqlite::Result<Vec<Row>>>()?;
        Ok(rows)
    }
}

/// Implement the conversion of a Value to ToSqlOutput
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Null => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Null)),
            Value::Integer(i) => i.to_sql(),
            Value::Float(f) => f.to_sql(),
            Value::Text(t) => t.to_sql(),
        }
    }
}

/// Read sql results as value
impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
            ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
        })
    }
}

/// Age in whole years at the reference date
fn age(dob: &str) -> Result<i64> {
    let dob = NaiveDate::parse_from_str(dob, "%Y-%m-%d").map_err(Error::other)?;
    let (year, month, day) = REFERENCE_DATE;
    let mut age = i64::from(year - dob.year());
    if (month, day) < (dob.month(), dob.day()) {
        age -= 1;
    }
    Ok(age)
}

type StaffRecord = (i64, &'static str, &'static str, &'static str, &'static str, &'static str, &'static str, &'static str, f64);

const STAFFS: [StaffRecord; 9] = [
    (1, "doctor", "001080000001", "Nguyen Van Minh", "1980-01-15", "M", "123 Le Loi, Hanoi", "Cardiology", 50.0),
    (2, "employee", "001082000002", "Tran Thi Mai", "1982-05-20", "F", "456 Nguyen Hue, HCM", "Accountant", 5.0),
    (3, "researcher", "001075000003", "Le Van Hung", "1975-11-10", "M", "789 Tran Hung Dao, Da Nang", "Data Science", 20.0),
    (4, "manager", "001088000004", "Pham Thi Lan", "1988-03-25", "F", "321 Ba Trieu, Hanoi", "Management", 100.0),
    (5, "doctor", "001085000005", "Hoang Van Tien", "1985-09-09", "M", "555 Giai Phong, Hanoi", "Neurology", 10.0),
    (6, "employee", "001090000006", "Nguyen Thi Hoa", "1990-12-12", "F", "888 Lang, Hanoi", "Cashier", 5.0),
    (7, "employee", "001092000007", "Vu Van Nam", "1992-06-15", "M", "222 Tay Son, Hanoi", "Security", 0.0),
    (8, "doctor", "001078000008", "Do Lan Huong", "1978-04-30", "F", "101 Kim Ma, Hanoi", "Pediatrics", 10.0),
    (9, "employee", "001086000009", "Le Thi Thu", "1986-07-20", "F", "999 Giang Vo, Hanoi", "Accountant", 5.0),
];

struct Patient {
    id: i64,
    national_id: String,
    full_name: String,
    dob: String,
    gender: &'static str,
    address: &'static str,
}

/// Age groups of the fixture: (first id, last id, label, date of birth, address)
const PATIENT_GROUPS: [(i64, i64, &str, &str, &str); 4] = [
    (1, 20, "Senior", "1950-06-01", "Nursing Home A"),
    (21, 50, "Adult", "1980-06-01", "Office Block B"),
    (51, 67, "Youth", "2005-06-01", "School C"),
    (68, 70, "Infant", "2025-01-01", "Nursery D"),
];

fn patients() -> impl Iterator<Item = Patient> {
    PATIENT_GROUPS
        .into_iter()
        .flat_map(|(first, last, label, dob, address)| {
            (first..=last).map(move |id| Patient {
                id,
                national_id: format!("001{}{:05}", &dob[..4], id),
                full_name: format!("{label} Patient {id}"),
                dob: dob.to_string(),
                gender: if id % 2 == 0 { "M" } else { "F" },
                address,
            })
        })
}

const DISEASES: [&str; 5] = ["Hypertension", "Migraine", "Flu", "Diabetes Type 2", "Asthma"];
const DOCTORS: [i64; 3] = [1, 5, 8];

/// One diagnosis for every senior and adult, plus a follow-up visit for seniors
fn diagnoses() -> Vec<(i64, i64, i64, &'static str, String)> {
    let first_visits = (1..=50).map(|patient_id: i64| {
        (
            patient_id,
            patient_id,
            DOCTORS[(patient_id % 3) as usize],
            DISEASES[((patient_id - 1) % 5) as usize],
            format!("2023-01-{:02}", (patient_id % 28) + 1),
        )
    });
    let follow_ups = (1..=20).map(|patient_id: i64| {
        (
            50 + patient_id,
            patient_id,
            DOCTORS[0],
            "Hypertension",
            format!("2023-02-{:02}", (patient_id % 28) + 1),
        )
    });
    first_visits.chain(follow_ups).collect()
}

/// An in-memory store with the hospital fixture loaded
pub fn test_database() -> SqliteStore {
    let store = SqliteStore::in_memory().expect("Database");
    store.seed_fixture().expect("Database with fixture");
    store
}
