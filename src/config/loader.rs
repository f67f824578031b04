//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a YAML document
    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR_NAME}` or
    /// `${VAR_NAME:-default}`.
    ///
    /// A reference to an unset variable without a default is left untouched.
    fn expand_env_vars(content: &str) -> String {
        let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("static regex is valid");

        re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_expand_env_vars() {
        std::env::set_var("FANOUT_TEST_VAR", "test_value");
        let content = "key: ${FANOUT_TEST_VAR}";
        let expanded = ConfigLoader::expand_env_vars(content);
        assert_eq!(expanded, "key: test_value");
        std::env::remove_var("FANOUT_TEST_VAR");
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_default() {
        std::env::remove_var("FANOUT_MISSING_VAR");
        let expanded = ConfigLoader::expand_env_vars("bucket: ${FANOUT_MISSING_VAR:-fallback}");
        assert_eq!(expanded, "bucket: fallback");
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_keeps_unknown() {
        std::env::remove_var("FANOUT_MISSING_VAR");
        let expanded = ConfigLoader::expand_env_vars("bucket: ${FANOUT_MISSING_VAR}");
        assert_eq!(expanded, "bucket: ${FANOUT_MISSING_VAR}");
    }

    #[test]
    fn test_parse_minimal() {
        let config = ConfigLoader::parse(
            r#"
storage:
  bucket: "media"
  region: "eu-west-1"
"#,
        )
        .unwrap();
        assert_eq!(config.storage.bucket, "media");
        assert_eq!(config.transform.quality, 80);
        assert!(config.upload.sizes.is_empty());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        let result = ConfigLoader::parse(
            r#"
storage:
  bucket: ""
  region: "eu-west-1"
"#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
