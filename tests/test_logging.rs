//! Tests for logging configuration and format parsing
//!
//! Covers the pure helpers behind `LOG_LEVEL` and `LOG_FORMAT`, plus global
//! subscriber installation.

use broker_connectivity::observability::logging::{
    build_filter, init_logging, parse_level, LogFormat,
};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for value in ["", "xml", "yaml", "123", "pretty-ish"] {
        assert_eq!(LogFormat::parse(value), LogFormat::Json, "value {value:?}");
    }
}

#[test]
fn test_parse_level_known_values() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("Info"), Level::INFO);
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("TRACE"), Level::TRACE);
}

#[test]
fn test_parse_level_unknown_defaults_to_info() {
    assert_eq!(parse_level(""), Level::INFO);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_build_filter_caps_noisy_dependencies() {
    let filter = build_filter(Level::DEBUG).to_string().to_lowercase();

    assert!(filter.contains("debug"));
    assert!(filter.contains("rumqttc=warn"));
    assert!(filter.contains("tokio=warn"));
}

#[test]
fn test_second_initialization_is_reported() {
    // Only one global subscriber per process; the second call must not panic
    let first = init_logging(Level::INFO, LogFormat::Compact, false);
    let second = init_logging(Level::DEBUG, LogFormat::Json, true);

    assert!(!second);
    let _ = first;
}
