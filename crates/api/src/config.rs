//! Server configuration

use duesledger_billing::DEFAULT_ELIGIBILITY_THRESHOLD_MONTHS;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("invalid {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Paid months at which a membership becomes eligible
    pub eligibility_threshold_months: i32,
    /// Initialize the Stripe client from STRIPE_* variables
    pub enable_stripe: bool,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let bind_address = lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let eligibility_threshold_months = match lookup("ELIGIBILITY_THRESHOLD_MONTHS") {
            Some(raw) => match raw.trim().parse::<i32>() {
                Ok(months) if months > 0 => months,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "ELIGIBILITY_THRESHOLD_MONTHS",
                        value: raw,
                    })
                }
            },
            None => DEFAULT_ELIGIBILITY_THRESHOLD_MONTHS,
        };

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address,
            eligibility_threshold_months,
            enable_stripe: flag(lookup("ENABLE_STRIPE"), true),
            allowed_origins,
            run_migrations: flag(lookup("RUN_MIGRATIONS"), true),
        })
    }
}

fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}
