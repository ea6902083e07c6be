//! Runtime configuration loaded from environment variables.

use chrono::Duration;

use crate::types::Timestamp;

/// Deployment environment. Controls document retention and billing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" => Environment::Staging,
            _ => Environment::Dev,
        }
    }

    /// Name used in billing record identifiers.
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

/// Pipeline configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment environment (default: `dev`).
    pub environment: Environment,
    /// Retention for iteration documents in production (default: `90`).
    pub retention_days_prod: i64,
    /// Retention for iteration documents elsewhere (default: `30`).
    pub retention_days: i64,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default |
    /// |--------------------------------|---------|
    /// | `ENVIRONMENT`                  | `dev`   |
    /// | `ITERATION_RETENTION_DAYS_PROD`| `90`    |
    /// | `ITERATION_RETENTION_DAYS`     | `30`    |
    pub fn from_env() -> Self {
        let environment =
            Environment::parse(&std::env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".into()));

        let retention_days_prod: i64 = std::env::var("ITERATION_RETENTION_DAYS_PROD")
            .unwrap_or_else(|_| "90".into())
            .parse()
            .expect("ITERATION_RETENTION_DAYS_PROD must be a valid i64");

        let retention_days: i64 = std::env::var("ITERATION_RETENTION_DAYS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("ITERATION_RETENTION_DAYS must be a valid i64");

        Self {
            environment,
            retention_days_prod,
            retention_days,
        }
    }

    /// Expiration timestamp for a new iteration document, counted from `now`.
    pub fn iteration_expiry(&self, now: Timestamp) -> Timestamp {
        let days = match self.environment {
            Environment::Production => self.retention_days_prod,
            _ => self.retention_days,
        };
        now + Duration::days(days)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            retention_days_prod: 90,
            retention_days: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn production_gets_long_retention() {
        let config = Config {
            environment: Environment::Production,
            ..Config::default()
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let expiry = config.iteration_expiry(now);
        assert_eq!((expiry - now).num_days(), 90);
    }

    #[test]
    fn dev_gets_short_retention() {
        let config = Config::default();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!((config.iteration_expiry(now) - now).num_days(), 30);
    }

    #[test]
    fn environment_parsing_accepts_aliases() {
        assert_eq!(Environment::parse("prod"), Environment::Production);
        assert_eq!(Environment::parse("PRODUCTION"), Environment::Production);
        assert_eq!(Environment::parse("staging"), Environment::Staging);
        assert_eq!(Environment::parse("anything"), Environment::Dev);
    }
}
