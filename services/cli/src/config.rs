use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the questionnaire backend (start / stream-question / answer).
    pub questionnaire_base: String,
    /// Full URL of the chat-completion endpoint used for insights.
    pub chat_url: String,
    /// Model identifier sent with insight requests.
    pub chat_model: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let questionnaire_base = std::env::var("QUESTIONNAIRE_API_BASE")
            .map_err(|_| ConfigError::MissingVar("QUESTIONNAIRE_API_BASE".to_string()))?;

        let chat_url = std::env::var("CHAT_API_URL")
            .unwrap_or_else(|_| "http://localhost:11434/api/chat".to_string());

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "fincoach".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            questionnaire_base,
            chat_url,
            chat_model,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("QUESTIONNAIRE_API_BASE");
            env::remove_var("CHAT_API_URL");
            env::remove_var("CHAT_MODEL");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        unsafe {
            env::set_var("QUESTIONNAIRE_API_BASE", "http://localhost:8080");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.questionnaire_base, "http://localhost:8080");
        assert_eq!(config.chat_url, "http://localhost:11434/api/chat");
        assert_eq!(config.chat_model, "fincoach");
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("QUESTIONNAIRE_API_BASE", "https://api.example.com/psych");
            env::set_var("CHAT_API_URL", "https://api.example.com/chat");
            env::set_var("CHAT_MODEL", "fincoach-pro");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.questionnaire_base, "https://api.example.com/psych");
        assert_eq!(config.chat_url, "https://api.example.com/chat");
        assert_eq!(config.chat_model, "fincoach-pro");
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_questionnaire_base() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "QUESTIONNAIRE_API_BASE"),
            _ => panic!("Expected MissingVar for QUESTIONNAIRE_API_BASE"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("QUESTIONNAIRE_API_BASE", "http://localhost:8080");
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
