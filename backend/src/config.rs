use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: String,
    /// Postgres URL; the in-memory storers are used when unset
    pub database_url: Option<String>,
    /// Redis URL for the execution queue; the in-memory broker is used when unset
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub admin_role: String,
    /// `role:table:actions;...` grants for non-admin roles
    pub table_grants: String,
    pub queue: QueueConfig,
    pub cascade_include_self: bool,
    pub simulation_timeout: Duration,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub workers: usize,
    /// How long a dequeued task may stay un-acked before it is redelivered
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "workflow:executions".to_string(),
            workers: 4,
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// SMTP configuration for the send_email action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Parse SMTP config only if SMTP_HOST is set
        let smtp = if env::var("SMTP_HOST").is_ok() {
            Some(SmtpConfig {
                host: env::var("SMTP_HOST").unwrap_or_default(),
                port: parse_or("SMTP_PORT", 587),
                username: env::var("SMTP_USERNAME").unwrap_or_default(),
                password: env::var("SMTP_PASSWORD").unwrap_or_default(),
                from_email: env::var("SMTP_FROM_EMAIL")
                    .unwrap_or_else(|_| "workflows@localhost".to_string()),
                from_name: env::var("SMTP_FROM_NAME")
                    .unwrap_or_else(|_| "Workflow Automation".to_string()),
            })
        } else {
            None
        };

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            name: env::var("WORKFLOW_QUEUE_NAME").unwrap_or(defaults.name),
            workers: parse_or("WORKFLOW_WORKERS", defaults.workers).max(1),
            visibility_timeout: Duration::from_secs(parse_or(
                "WORKFLOW_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
            )),
            poll_interval: Duration::from_millis(parse_or(
                "WORKFLOW_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
        };

        Ok(Config {
            server_addr: env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| {
                tracing::warn!("JWT_SECRET not set, using default (insecure for production)");
                "your-secret-key-change-in-production".to_string()
            }),
            admin_role: env::var("ADMIN_ROLE").unwrap_or_else(|_| "admin".to_string()),
            table_grants: env::var("TABLE_GRANTS").unwrap_or_default(),
            queue,
            cascade_include_self: parse_or("CASCADE_INCLUDE_SELF", false),
            simulation_timeout: Duration::from_secs(parse_or("SIMULATION_TIMEOUT_SECS", 30)),
            smtp,
        })
    }
}

impl SmtpConfig {
    /// Check if SMTP is properly configured
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
