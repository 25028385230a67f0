//! # Structured Logging Module
//!
//! Environment-aware structured logging that outputs to both console and
//! files for debugging long-running batch workflows.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        // Create log directory if it doesn't exist
        let log_dir = PathBuf::from("log");
        if !log_dir.exists() {
            fs::create_dir_all(&log_dir).expect("Failed to create log directory");
        }

        // Generate log file name with environment, PID, and timestamp
        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");
        let log_path = log_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level)),
            );

        // Use try_init to avoid panic if a global subscriber already exists
        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_path.display(),
            "🔧 STRUCTURED LOGGING: Initialized with file output"
        );

        // Keep the flush guard alive for the process lifetime
        std::mem::forget(guard);
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("ANALYST_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for job operations
pub fn log_job_operation(
    operation: &str,
    job_id: Option<i64>,
    job_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = job_id,
        job_name = job_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 JOB_OPERATION"
    );
}

/// Log structured data for credential pool events. Only the redacted
/// suffix ever reaches the log stream.
pub fn log_credential_event(
    operation: &str,
    credential_suffix: &str,
    used_today: u32,
    daily_quota: u32,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        credential = %credential_suffix,
        used_today = used_today,
        daily_quota = daily_quota,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔑 CREDENTIAL_EVENT"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        std::env::set_var("ANALYST_ENV", "test_override");
        let env = get_environment();
        assert_eq!(env, "test_override");
        std::env::remove_var("ANALYST_ENV");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("unknown"), "debug");
    }
}
