//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::MuxConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<MuxConfig, ConfigError> {
    let config: MuxConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<MuxConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Protocol;

    #[test]
    fn parses_partial_config_with_defaults() {
        let config = parse_config(
            r#"
            [upstream]
            protocol = "http3"
            max_concurrent_streams = 1
            buffer_limit_bytes = 1024

            [[clusters]]
            name = "cluster_0"
            address = "127.0.0.1:10000"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.protocol, Protocol::Http3);
        assert_eq!(config.upstream.max_concurrent_streams, 1);
        assert_eq!(config.upstream.max_response_headers_count, 100);
        assert_eq!(config.upstream.advertised_stream_window(), 1024);
        assert_eq!(config.clusters[0].name, "cluster_0");
        assert_eq!(config.timeouts.connect_secs, 5);
    }

    #[test]
    fn validation_errors_surface() {
        let err = parse_config("[upstream]\nmax_frame_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref e) if e.len() == 1));
        assert!(err.to_string().contains("upstream.max_frame_size"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/upstream-mux.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn loads_from_disk() {
        let path = std::env::temp_dir().join(format!("upstream-mux-{}.toml", std::process::id()));
        fs::write(&path, "[timeouts]\nidle_secs = 7\n").unwrap();
        let config = load_config(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.timeouts.idle_secs, 7);
    }
}
