use anyhow::{bail, Context, Result};
use rust_decimal::RoundingStrategy;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

/// Business rules for the budget and milestone workflow.
///
/// Every knob has a default observed in the marketplace; they are only
/// overridden for tests or regional deployments.
#[derive(Debug, Clone)]
pub struct WorkflowPolicy {
    /// How many days ahead candidate dates are offered for a weekday.
    pub schedule_horizon_days: u32,
    pub attachment_max_bytes: usize,
    pub attachment_max_count: usize,
    pub problem_description_min_chars: usize,
    pub solution_description_max_chars: usize,
    /// Decimal places kept on milestone percentages.
    pub percent_scale: u32,
    /// Decimal places kept on money amounts (smallest currency unit).
    pub amount_scale: u32,
    pub rounding: RoundingStrategy,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            schedule_horizon_days: 60,
            attachment_max_bytes: 5 * 1024 * 1024,
            attachment_max_count: 5,
            problem_description_min_chars: 10,
            solution_description_max_chars: 1000,
            percent_scale: 2,
            amount_scale: 2,
            rounding: RoundingStrategy::MidpointAwayFromZero,
        }
    }
}

/// Decimal places of `budgets.total` NUMERIC(14,2).
const MAX_AMOUNT_SCALE: u32 = 2;
/// Decimal places of `milestones.percentage` NUMERIC(7,4).
const MAX_PERCENT_SCALE: u32 = 4;

impl WorkflowPolicy {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let rounding = match env::var("MILESTONE_ROUNDING") {
            Ok(value) => parse_rounding(&value)?,
            Err(_) => defaults.rounding,
        };

        let policy = Self {
            schedule_horizon_days: env_or("SCHEDULE_HORIZON_DAYS", defaults.schedule_horizon_days),
            attachment_max_bytes: env_or("ATTACHMENT_MAX_BYTES", defaults.attachment_max_bytes),
            attachment_max_count: env_or("ATTACHMENT_MAX_COUNT", defaults.attachment_max_count),
            problem_description_min_chars: env_or(
                "PROBLEM_DESCRIPTION_MIN_CHARS",
                defaults.problem_description_min_chars,
            ),
            solution_description_max_chars: env_or(
                "SOLUTION_DESCRIPTION_MAX_CHARS",
                defaults.solution_description_max_chars,
            ),
            percent_scale: env_or("MILESTONE_PERCENT_SCALE", defaults.percent_scale),
            amount_scale: env_or("MILESTONE_AMOUNT_SCALE", defaults.amount_scale),
            rounding,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Rejects scales the database would silently round away, which would
    /// break the exact milestone sums.
    pub fn validate(&self) -> Result<()> {
        if self.amount_scale > MAX_AMOUNT_SCALE {
            bail!(
                "MILESTONE_AMOUNT_SCALE must be at most {}, got {}",
                MAX_AMOUNT_SCALE,
                self.amount_scale
            );
        }
        if self.percent_scale > MAX_PERCENT_SCALE {
            bail!(
                "MILESTONE_PERCENT_SCALE must be at most {}, got {}",
                MAX_PERCENT_SCALE,
                self.percent_scale
            );
        }
        Ok(())
    }
}

fn parse_rounding(value: &str) -> Result<RoundingStrategy> {
    match value.trim().to_lowercase().as_str() {
        "half_up" | "half_away_from_zero" => Ok(RoundingStrategy::MidpointAwayFromZero),
        "half_even" | "bankers" => Ok(RoundingStrategy::MidpointNearestEven),
        other => bail!("MILESTONE_ROUNDING must be half_up or half_even, got '{}'", other),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // CORS
    pub cors_allow_origins: Vec<String>,

    // Identity provider
    pub jwt_jwks_url: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwks_cache_ttl_seconds: u64,

    // Escrow provider
    pub escrow_service_url: url::Url,
    pub escrow_service_token: String,
    pub escrow_timeout_seconds: u64,
    pub escrow_max_retry_seconds: u64,

    pub policy: WorkflowPolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("ENV").unwrap_or_else(|_| "dev".to_string()));
        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        // Database
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = env_or("DATABASE_MAX_CONNECTIONS", 10);
        let run_migrations = env_or("RUN_MIGRATIONS", true);

        // CORS
        let cors_allow_origins = env::var("CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        // Identity provider
        let jwt_jwks_url = env::var("AUTH_JWT_JWKS_URL").context("AUTH_JWT_JWKS_URL must be set")?;
        let jwt_issuer = env::var("AUTH_JWT_ISSUER").context("AUTH_JWT_ISSUER must be set")?;
        let jwt_audience =
            env::var("AUTH_JWT_AUDIENCE").unwrap_or_else(|_| "authenticated".to_string());
        let jwks_cache_ttl_seconds = env_or("JWKS_CACHE_TTL_SECONDS", 1800); // 30 minutes

        // Escrow provider
        let escrow_service_url = env::var("ESCROW_SERVICE_URL")
            .context("ESCROW_SERVICE_URL must be set")?
            .parse::<url::Url>()
            .context("ESCROW_SERVICE_URL is not a valid URL")?;
        let escrow_service_token =
            env::var("ESCROW_SERVICE_TOKEN").context("ESCROW_SERVICE_TOKEN must be set")?;
        let escrow_timeout_seconds = env_or("ESCROW_TIMEOUT_SECONDS", 10);
        let escrow_max_retry_seconds = env_or("ESCROW_MAX_RETRY_SECONDS", 30);

        let policy = WorkflowPolicy::from_env()?;

        Ok(Settings {
            env,
            server_addr,
            database_url,
            database_max_connections,
            run_migrations,
            cors_allow_origins,
            jwt_jwks_url,
            jwt_issuer,
            jwt_audience,
            jwks_cache_ttl_seconds,
            escrow_service_url,
            escrow_service_token,
            escrow_timeout_seconds,
            escrow_max_retry_seconds,
            policy,
        })
    }
}
