//! Tracing subscriber setup

use anyhow::Result;
use tracing::Level as TraceLevel;
use tracing_subscriber::FmtSubscriber;

/// Level from `--log-level`, else `LOG_LEVEL`, else info
pub fn init(level: Option<&str>) -> Result<()> {
    let level = level
        .map(str::to_string)
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());

    // Logs go to stderr so client output on stdout stays parseable
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&level))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn parse_level(level: &str) -> TraceLevel {
    match level.to_lowercase().as_str() {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), TraceLevel::DEBUG);
        assert_eq!(parse_level("warn"), TraceLevel::WARN);
        assert_eq!(parse_level("verbose"), TraceLevel::INFO);
    }
}
