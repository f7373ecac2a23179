use colored::Colorize;
use hospital_privacy::{
    budget::BudgetLedger,
    config::Config,
    io::{
        sqlite::{test_database, SqliteStore},
        Store, Value,
    },
    pipeline::{Error, Pipeline, PRIVACY_VIOLATION},
    policy::Role,
    rewriting::Rewriter,
    setup,
    validation::Validator,
};
use std::{
    sync::{Arc, Barrier},
    thread,
};

const DOCTOR: &str = "001080000001";
const OTHER_DOCTOR: &str = "001085000005";
const LAST_DOCTOR: &str = "001078000008";
const RESEARCHER: &str = "001075000003";
const MANAGER: &str = "001088000004";

fn pipeline(seed: u64) -> Pipeline {
    setup::init_for_tests();
    Pipeline::with_store(
        Arc::new(test_database()),
        Config::default().with_noise_seed(seed),
    )
    .unwrap()
}

fn true_count(store: &dyn Store, query: &str) -> f64 {
    store.query(query).unwrap()[0].value(0).and_then(Value::as_f64).unwrap()
}

#[test]
fn test_generalization() {
    let validator = Validator::default();
    let rewriter = Rewriter::default();
    for (query, expected) in [
        (
            "SELECT COUNT(*) FROM patients WHERE age = 63",
            "SELECT COUNT(*) FROM patients WHERE age >= 60 AND age < 70",
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE age < 63",
            "SELECT COUNT(*) FROM patients WHERE age < 70",
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE age >= 63",
            "SELECT COUNT(*) FROM patients WHERE age >= 60",
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE age <= 60",
            "SELECT COUNT(*) FROM patients WHERE age < 60",
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE (age) = 63",
            "SELECT COUNT(*) FROM patients WHERE age >= 60 AND age < 70",
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE 63 > ((age))",
            "SELECT COUNT(*) FROM patients WHERE age < 70",
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE age = -9223372036854775808",
            "SELECT COUNT(*) FROM patients WHERE age = -9223372036854775808",
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE age >= -9223372036854775808",
            "SELECT COUNT(*) FROM patients WHERE age >= -9223372036854775808",
        ),
    ] {
        let validated = validator.validate(query, &Role::Doctor.policy()).unwrap();
        let rewritten = rewriter.rewrite(validated);
        println!("{}\n{}", query.red(), rewritten.to_string().yellow());
        assert_eq!(rewritten.to_string(), expected);
    }
}

#[test]
fn test_privacy_violation_reveals_nothing() {
    let pipeline = pipeline(1);
    let mut messages = vec![];
    for query in [
        "SELECT COUNT(*) FROM patients WHERE age < 5",
        "SELECT COUNT(*) FROM patients WHERE age > 200",
        "SELECT COUNT(*) FROM patients GROUP BY age",
        "SELECT AVG(age) FROM patients WHERE age = 1 AND gender = 'F'",
    ] {
        match pipeline.process(query, DOCTOR, 1.) {
            Err(Error::PrivacyViolation(message)) => {
                println!("{query} => {message}");
                assert_eq!(message, PRIVACY_VIOLATION);
                messages.push(message);
            }
            result => panic!("{query} should be blocked, got {result:?}"),
        }
    }
    // Three infants or nobody at all: the same answer
    assert!(messages.iter().all(|m| m == &messages[0]));
    assert_eq!(pipeline.ledger().get_budget(DOCTOR).unwrap(), 50.);
}

#[test]
fn test_neighbouring_databases() {
    let database = test_database();
    let neighbour = test_database();
    neighbour
        .execute("DELETE FROM patients WHERE patient_id = ?1", &[Value::Integer(21)])
        .unwrap();
    let validator = Validator::default();
    let rewriter = Rewriter::default();
    for query in [
        "SELECT COUNT(*) FROM patients",
        "SELECT COUNT(*) FROM patients WHERE age = 45",
        "SELECT COUNT(*) FROM patients WHERE age >= 40 AND gender = 'F'",
        "SELECT COUNT(*) FROM patients WHERE age < 30 OR gender = 'M'",
        "SELECT COUNT(age) FROM patients WHERE age > 70",
    ] {
        let rewritten = rewriter
            .rewrite(validator.validate(query, &Role::Researcher.policy()).unwrap())
            .to_string();
        let (count, neighbour_count) = (
            true_count(&database, &rewritten),
            true_count(&neighbour, &rewritten),
        );
        println!("{} {count} vs {neighbour_count}", rewritten.yellow());
        assert!((count - neighbour_count).abs() <= 1.);
    }
}

#[test]
fn test_count_is_a_non_negative_integer() {
    let pipeline = pipeline(2);
    pipeline.ledger().reset(MANAGER, 1000.).unwrap();
    for _ in 0..50 {
        for query in [
            "SELECT COUNT(*) FROM diagnoses WHERE disease_name = 'Flu'",
            "SELECT COUNT(*), gender FROM patients GROUP BY gender",
        ] {
            for row in pipeline.process(query, MANAGER, 0.1).unwrap().rows {
                assert!(row.value >= 0.);
                assert_eq!(row.value, row.value.round());
            }
        }
    }
}

#[test]
fn test_utility() {
    let pipeline = pipeline(2026);
    pipeline.ledger().reset(RESEARCHER, 1000.).unwrap();
    let true_value = 30.;
    let errors: Vec<f64> = (0..200)
        .map(|_| {
            let response = pipeline
                .process("SELECT COUNT(*) FROM patients WHERE age = 45", RESEARCHER, 1.)
                .unwrap();
            response.result_value().unwrap() - true_value
        })
        .collect();
    let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / errors.len() as f64;
    let bias = errors.iter().sum::<f64>() / errors.len() as f64;
    println!("MAE {mae}, bias {bias}");
    assert!(mae < 2. * (1. / 1.));
    assert!(bias.abs() < 0.5);
    assert!(mae / true_value < 0.1);
    assert_eq!(pipeline.ledger().get_budget(RESEARCHER).unwrap(), 800.);
}

#[test]
fn test_budget_exhaustion() {
    let pipeline = pipeline(3);
    assert_eq!(pipeline.ledger().get_budget(LAST_DOCTOR).unwrap(), 10.);
    let mut successes = 0;
    loop {
        match pipeline.process("SELECT COUNT(*) FROM patients", LAST_DOCTOR, 3.) {
            Ok(_) => successes += 1,
            Err(Error::BudgetExhausted {
                requested,
                remaining,
            }) => {
                assert_eq!(requested, 3.);
                assert_eq!(remaining, 1.);
                break;
            }
            Err(err) => panic!("{err}"),
        }
    }
    assert_eq!(successes, 3);
    for _ in 0..5 {
        assert!(matches!(
            pipeline.process("SELECT COUNT(*) FROM patients", LAST_DOCTOR, 3.),
            Err(Error::BudgetExhausted { .. })
        ));
        assert_eq!(pipeline.ledger().get_budget(LAST_DOCTOR).unwrap(), 1.);
    }
}

#[test]
fn test_isolation() {
    let pipeline = pipeline(4);
    for _ in 0..3 {
        pipeline
            .process("SELECT COUNT(*) FROM patients", OTHER_DOCTOR, 2.)
            .unwrap();
    }
    assert_eq!(pipeline.ledger().get_budget(OTHER_DOCTOR).unwrap(), 4.);
    assert_eq!(pipeline.ledger().get_budget(DOCTOR).unwrap(), 50.);
    assert_eq!(pipeline.ledger().get_budget(LAST_DOCTOR).unwrap(), 10.);
}

#[test]
fn test_concurrent_requests() {
    for round in 0..10 {
        let pipeline = Arc::new(pipeline(round));
        pipeline.ledger().reset(DOCTOR, 10.).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pipeline = pipeline.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pipeline.process("SELECT AVG(age) FROM patients WHERE age >= 40", DOCTOR, 6.)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(Error::BudgetExhausted { .. })))
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(pipeline.ledger().get_budget(DOCTOR).unwrap(), 4.);
    }
}

#[test]
fn test_durability() {
    setup::init_for_tests();
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("hospital.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.seed_fixture().unwrap();
        let pipeline = Pipeline::with_store(Arc::new(store), Config::default()).unwrap();
        pipeline
            .process("SELECT SUM(age) FROM patients WHERE age > 40", RESEARCHER, 2.5)
            .unwrap();
        pipeline.ledger().consume(DOCTOR, 0.5).unwrap();
    }
    let ledger = BudgetLedger::new(Arc::new(SqliteStore::open(&path).unwrap()));
    assert_eq!(ledger.get_budget(RESEARCHER).unwrap(), 17.5);
    assert_eq!(ledger.get_budget(DOCTOR).unwrap(), 49.5);
}

#[test]
fn test_deferred_commit() {
    setup::init_for_tests();
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("hospital.db");
    let store = SqliteStore::open(&path).unwrap();
    store.seed_fixture().unwrap();
    let pipeline = Pipeline::with_store(
        Arc::new(store),
        Config::default().with_deferred_commit(true),
    )
    .unwrap();
    for _ in 0..8 {
        pipeline
            .process("SELECT MAX(age) FROM patients", MANAGER, 0.25)
            .unwrap();
    }
    pipeline.flush().unwrap();
    assert_eq!(pipeline.ledger().get_budget(MANAGER).unwrap(), 98.);
    drop(pipeline);
    let ledger = BudgetLedger::new(Arc::new(SqliteStore::open(&path).unwrap()));
    assert_eq!(ledger.get_budget(MANAGER).unwrap(), 98.);
}

#[test]
fn test_refused_queries() {
    let pipeline = pipeline(5);
    for (query, principal) in [
        ("SELECT COUNT(*) FROM patients; DELETE FROM patients", DOCTOR),
        ("UPDATE staffs SET privacy_budget = 1000 WHERE national_id = '001080000001'", MANAGER),
        ("SELECT COUNT(*) FROM patients JOIN diagnoses ON patients.patient_id = diagnoses.patient_id", DOCTOR),
        ("SELECT COUNT(*) FROM patients WHERE patient_id IN (SELECT patient_id FROM diagnoses)", DOCTOR),
        ("SELECT COUNT(national_id) FROM patients", MANAGER),
        ("SELECT COUNT(*) FROM patients WHERE 1 = 1", RESEARCHER),
        ("SELECT COUNT(*) FROM staffs", DOCTOR),
        ("SELECT COUNT(*) FROM patients", "001090000006"),
        ("SELECT COUNT(*) FROM staffs WHERE privacy_budget > 3", "001082000002"),
        ("SELEC COUNT(*) FROM patients", DOCTOR),
    ] {
        let result = pipeline.process(query, principal, 1.);
        println!("{}\n{}", query.red(), format!("{result:?}").yellow());
        assert!(matches!(result, Err(Error::Security(_))));
    }
    assert_eq!(pipeline.ledger().get_budget(DOCTOR).unwrap(), 50.);
    assert_eq!(pipeline.ledger().get_budget(MANAGER).unwrap(), 100.);
}

#[test]
fn test_accounting_reads_staff_budgets() {
    let pipeline = pipeline(6);
    // Only nine staff members: below the cohort threshold by default
    assert!(matches!(
        pipeline.process("SELECT SUM(privacy_budget) FROM staffs", "001082000002", 1.),
        Err(Error::PrivacyViolation(_))
    ));
    let pipeline = Pipeline::with_store(
        Arc::new(test_database()),
        Config::default().with_min_cohort_size(5),
    )
    .unwrap();
    let response = pipeline
        .process("SELECT SUM(privacy_budget) FROM staffs", "001082000002", 1.)
        .unwrap();
    println!("{response}");
    assert!(response.result_value().unwrap() >= 0.);
}
