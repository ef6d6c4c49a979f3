//! Credential resolution with source tracking.
//!
//! ## Token Precedence (highest to lowest)
//!
//! 1. `IMAGEBUMP_GITHUB_TOKEN` environment variable
//! 2. `github.token` in the config file
//!
//! The username always comes from the config file.

use super::{Config, ConfigError};
use crate::graph::Credentials;

/// Environment variable name for GitHub token override.
pub const GITHUB_TOKEN_ENV: &str = "IMAGEBUMP_GITHUB_TOKEN";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from environment variable
    EnvVar(String),
    /// Value from the config file
    ConfigFile,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::ConfigFile => write!(f, "config"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Credentials plus where the token came from.
#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    pub username: String,
    pub token: Resolved<String>,
}

impl ResolvedCredentials {
    /// Credentials in the form the git and HTTP clients take.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.token.value.clone())
    }

    pub fn token_source(&self) -> &ValueSource {
        &self.token.source
    }

    /// Get the masked token for display purposes.
    pub fn masked_token(&self) -> String {
        mask_token(&self.token.value)
    }
}

/// First and last four characters, or just the first four for short tokens.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        let head: String = chars.iter().take(4).collect();
        format!("{}...", head)
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

/// Resolve credentials from the process environment and the config.
pub fn resolve_credentials(config: &Config) -> Result<ResolvedCredentials, ConfigError> {
    resolve_credentials_with_env(config, std::env::var(GITHUB_TOKEN_ENV).ok())
}

/// Resolve credentials with an explicit environment value (for testing).
///
/// An empty environment value is ignored.
pub fn resolve_credentials_with_env(
    config: &Config,
    env_token: Option<String>,
) -> Result<ResolvedCredentials, ConfigError> {
    let token = match env_token.filter(|t| !t.trim().is_empty()) {
        Some(token) => Resolved::new(token, ValueSource::EnvVar(GITHUB_TOKEN_ENV.to_string())),
        None => match config.github.token.as_ref() {
            Some(token) if !token.trim().is_empty() => {
                Resolved::new(token.clone(), ValueSource::ConfigFile)
            }
            _ => return Err(ConfigError::MissingToken),
        },
    };

    Ok(ResolvedCredentials {
        username: config.github.username.clone(),
        token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: Option<&str>) -> Config {
        let token_line = token
            .map(|t| format!("token = \"{}\"\n", t))
            .unwrap_or_default();
        let toml = format!(
            "[github]\nusername = \"bot\"\n{}\n[repos.a]\nurl = \"https://github.com/o/a\"\ndir = \"/tmp/a\"\n",
            token_line
        );
        Config::from_toml_str(&toml).unwrap()
    }

    #[test]
    fn test_value_source_display() {
        assert_eq!(
            format!("{}", ValueSource::EnvVar("FOO".to_string())),
            "env:FOO"
        );
        assert_eq!(format!("{}", ValueSource::ConfigFile), "config");
    }

    #[test]
    fn test_env_takes_precedence() {
        let resolved =
            resolve_credentials_with_env(&config(Some("from_file")), Some("from_env".into()))
                .unwrap();
        assert_eq!(resolved.token.value, "from_env");
        assert_eq!(
            *resolved.token_source(),
            ValueSource::EnvVar(GITHUB_TOKEN_ENV.to_string())
        );
        assert_eq!(resolved.credentials().username, "bot");
    }

    #[test]
    fn test_config_file_fallback() {
        let resolved = resolve_credentials_with_env(&config(Some("from_file")), None).unwrap();
        assert_eq!(resolved.token.value, "from_file");
        assert_eq!(*resolved.token_source(), ValueSource::ConfigFile);
    }

    #[test]
    fn test_empty_env_is_ignored() {
        let resolved =
            resolve_credentials_with_env(&config(Some("from_file")), Some("  ".into())).unwrap();
        assert_eq!(resolved.token.value, "from_file");
    }

    #[test]
    fn test_missing_token() {
        let err = resolve_credentials_with_env(&config(None), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken));
    }

    #[test]
    #[serial_test::serial]
    fn test_resolve_credentials_reads_process_env() {
        unsafe { std::env::set_var(GITHUB_TOKEN_ENV, "from_process_env") };
        let resolved = resolve_credentials(&config(Some("from_file")));
        unsafe { std::env::remove_var(GITHUB_TOKEN_ENV) };

        let resolved = resolved.unwrap();
        assert_eq!(resolved.token.value, "from_process_env");
        assert_eq!(resolved.masked_token(), "from..._env");
    }

    #[test]
    fn test_masked_token() {
        assert_eq!(mask_token("ghp_1234567890abcdef"), "ghp_...cdef");
        assert_eq!(mask_token("short"), "shor...");
        assert_eq!(mask_token("ab"), "ab...");
    }
}
