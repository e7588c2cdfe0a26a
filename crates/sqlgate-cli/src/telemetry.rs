use std::env;

use anyhow::{Context, Result};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FILTER_ENV: &str = "SQLGATE_LOG";
const FORMAT_ENV: &str = "SQLGATE_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Installs the global subscriber. Logs go to stderr so that stdout carries
/// only command output.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let (format, format_warning) = parse_log_format(env::var(FORMAT_ENV).ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("installing tracing subscriber")?;

    if let Some(message) = format_warning {
        warn!("{message}");
    }
    Ok(())
}

pub fn parse_log_format(raw: Option<&str>) -> (LogFormat, Option<String>) {
    match raw.map(str::trim) {
        None | Some("") => (LogFormat::Text, None),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "text" | "pretty" => (LogFormat::Text, None),
            "json" => (LogFormat::Json, None),
            _ => (
                LogFormat::Text,
                Some(format!(
                    "{FORMAT_ENV}='{value}' is not one of text, json; defaulting to text"
                )),
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_formats() {
        assert_eq!(parse_log_format(Some("json")), (LogFormat::Json, None));
        assert_eq!(parse_log_format(Some(" JSON ")), (LogFormat::Json, None));
        assert_eq!(parse_log_format(Some("text")), (LogFormat::Text, None));
    }

    #[test]
    fn parse_missing_format() {
        assert_eq!(parse_log_format(None), (LogFormat::Text, None));
        assert_eq!(parse_log_format(Some("   ")), (LogFormat::Text, None));
    }

    #[test]
    fn parse_unknown_format() {
        let (format, warning) = parse_log_format(Some("xml"));
        assert_eq!(format, LogFormat::Text);
        assert!(warning
            .unwrap()
            .contains("SQLGATE_LOG_FORMAT='xml' is not one of text, json"));
    }
}
