use app_volume_lib::config::SupervisorConfig;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Tests for loading supervisor configuration from disk
#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_load_partial_config_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "settle_delay_ms": 250, "tap": {{ "readiness_timeout_ms": 500 }} }}"#
        )
        .unwrap();

        let config = SupervisorConfig::load(file.path()).expect("config should load");

        assert_eq!(config.settle_delay(), Duration::from_millis(250));
        assert_eq!(config.tap.readiness_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_recreate_attempts, 3);
        assert_eq!(config.tap.limiter_threshold, 0.8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_recreate_attempts": 0 }}"#).unwrap();

        let error = SupervisorConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", error).contains("max_recreate_attempts"));
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let error = SupervisorConfig::load(file.path()).unwrap_err();
        assert!(error.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SupervisorConfig::load(&dir.path().join("config.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = SupervisorConfig {
            prune_interval_ms: 0,
            ..SupervisorConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SupervisorConfig::from_json_str(&json).unwrap();

        assert_eq!(parsed, config);
        assert!(parsed.prune_interval().is_none());
    }
}
