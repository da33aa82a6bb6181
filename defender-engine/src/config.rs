use serde::{Deserialize, Serialize};

/// Engine configuration: the server-level directives that are not rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Downgrade BLOCK and DROP dispositions to LOG (`LearningMode`)
    pub learning_mode: bool,
    /// Enable the SQL injection oracle, surfaced as internal rule 17
    pub libinjection_sql: bool,
    /// Enable the XSS oracle, surfaced as internal rule 18
    pub libinjection_xss: bool,
    /// Request body limit in bytes; larger bodies are blocked unscanned (0 = unlimited)
    pub request_body_limit: u64,
    /// Block instead of scanning raw when a body fails to parse
    pub fail_closed: bool,
    /// Audit log settings (`MatchLog`)
    pub match_log: MatchLogConfig,
}

/// Audit log destination and format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchLogConfig {
    /// Destination path; a leading `|` denotes a pipe target
    pub path: Option<String>,
    /// Record format written to the destination
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Stable Naxsi-style line for downstream parsers
    Native,
    /// One JSON object per line
    Json,
}

/// Already-tokenized rule directives, as the host's config reader hands them over
///
/// Each vector holds the flat argument stream of every directive of that
/// family, concatenated in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDirectives {
    pub main_rules: Vec<String>,
    pub check_rules: Vec<String>,
    pub basic_rules: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            learning_mode: true,
            libinjection_sql: false,
            libinjection_xss: false,
            request_body_limit: 0,
            fail_closed: false,
            match_log: MatchLogConfig {
                path: None,
                format: LogFormat::Native,
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("DEFENDER"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to file
    #[allow(dead_code)]
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(path) = &self.match_log.path {
            if path.is_empty() || path == "|" {
                return Err("Match log path cannot be empty".to_string());
            }
        }

        Ok(())
    }

    /// True when either oracle is enabled
    pub fn libinjection_enabled(&self) -> bool {
        self.libinjection_sql || self.libinjection_xss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.learning_mode);
        assert!(!config.libinjection_enabled());
    }

    #[test]
    fn test_empty_match_log_path_rejected() {
        let mut config = EngineConfig::default();
        config.match_log.path = Some(String::new());
        assert!(config.validate().is_err());

        config.match_log.path = Some("|".to_string());
        assert!(config.validate().is_err());
    }
}
