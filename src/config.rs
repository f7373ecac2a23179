//! Middleware configuration, loaded from JSON or built from defaults.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, error, fmt, fs, path::Path, result};

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParsingError(String),
    InvalidConfig(String),
    Other(String),
}

impl Error {
    pub fn parsing_error(input: impl fmt::Display) -> Error {
        Error::ParsingError(format!("Cannot parse {}", input))
    }
    pub fn invalid_config(desc: impl fmt::Display) -> Error {
        Error::InvalidConfig(format!("Invalid configuration: {}", desc))
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParsingError(input) => writeln!(f, "ParsingError: {}", input),
            Error::InvalidConfig(desc) => writeln!(f, "InvalidConfig: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::parsing_error(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::other(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

pub const DEFAULT_MIN_COHORT_SIZE: u64 = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Smallest group of distinct subjects a query may touch (k)
    pub min_cohort_size: u64,
    /// Public `[lower, upper]` range of the columns SUM, AVG, MIN and MAX may read
    pub bounds: BTreeMap<String, [f64; 2]>,
    /// Commit budget deductions on a background worker
    pub deferred_commit: bool,
    /// Seed the noise generator, for reproducible runs only
    pub noise_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_cohort_size: DEFAULT_MIN_COHORT_SIZE,
            bounds: BTreeMap::from([
                ("age".to_string(), [0., 120.]),
                ("privacy_budget".to_string(), [0., 100.]),
            ]),
            deferred_commit: false,
            noise_seed: None,
        }
    }
}

impl Config {
    /// Parse a JSON document, missing fields take their default value
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
        Config::from_json(&fs::read_to_string(path)?)
    }

    pub fn with_min_cohort_size(self, min_cohort_size: u64) -> Config {
        Config {
            min_cohort_size,
            ..self
        }
    }

    pub fn with_bounds(mut self, column: &str, lower: f64, upper: f64) -> Config {
        self.bounds.insert(column.to_lowercase(), [lower, upper]);
        self
    }

    pub fn with_deferred_commit(self, deferred_commit: bool) -> Config {
        Config {
            deferred_commit,
            ..self
        }
    }

    pub fn with_noise_seed(self, seed: u64) -> Config {
        Config {
            noise_seed: Some(seed),
            ..self
        }
    }

    /// The configured range of a column
    pub fn bounds(&self, column: &str) -> Option<(f64, f64)> {
        self.bounds
            .get(&column.to_lowercase())
            .map(|[lower, upper]| (*lower, *upper))
    }

    fn validate(self) -> Result<Config> {
        if self.min_cohort_size == 0 {
            return Err(Error::invalid_config("min_cohort_size must be at least 1"));
        }
        for (column, [lower, upper]) in &self.bounds {
            if !(lower.is_finite() && upper.is_finite() && lower <= upper) {
                return Err(Error::invalid_config(format!(
                    "bounds [{lower}, {upper}] of {column}"
                )));
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default() {
        let config = Config::default();
        assert_eq!(config.min_cohort_size, 10);
        assert_eq!(config.bounds("AGE"), Some((0., 120.)));
        assert_eq!(config.bounds("privacy_budget"), Some((0., 100.)));
        assert_eq!(config.bounds("staff_id"), None);
        assert!(!config.deferred_commit);
    }

    #[test]
    fn test_from_json() -> Result<()> {
        let config = Config::from_json(r#"{"min_cohort_size": 5, "deferred_commit": true}"#)?;
        println!("{config:?}");
        assert_eq!(config.min_cohort_size, 5);
        assert!(config.deferred_commit);
        assert_eq!(config.bounds("age"), Some((0., 120.)));
        let config = Config::from_json(r#"{"bounds": {"staff_id": [1, 9]}, "noise_seed": 7}"#)?;
        assert_eq!(config.bounds("staff_id"), Some((1., 9.)));
        assert_eq!(config.bounds("age"), None);
        assert_eq!(config.noise_seed, Some(7));
        assert!(matches!(
            Config::from_json(r#"{"min_cohort_size": 0}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"bounds": {"age": [10, 0]}}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(Config::from_json("{"), Err(Error::ParsingError(_))));
        Ok(())
    }

    #[test]
    fn test_from_path() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"min_cohort_size": 3}}"#)?;
        let config = Config::from_path(file.path())?;
        assert_eq!(config.min_cohort_size, 3);
        assert_eq!(
            Config::default().with_min_cohort_size(3).with_bounds("Age", 0., 120.),
            config
        );
        Ok(())
    }
}
