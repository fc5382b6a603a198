//! Secret sources for SASL passwords and token secrets

use std::fmt;
use std::fs;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::Result;

/// Where a secret comes from.
///
/// Sources are checked in order: literal value, environment variable, file.
/// The environment variable is removed from the process once it has been read.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Literal secret value
    pub password: String,
    /// Name of an environment variable holding the secret
    pub password_env_var: String,
    /// Path of a file holding the secret
    pub password_file: String,
}

impl CredentialConfig {
    /// Literal secret
    pub fn literal<S: Into<String>>(secret: S) -> Self {
        Self {
            password: secret.into(),
            ..Default::default()
        }
    }

    /// Secret read from an environment variable
    pub fn env<S: Into<String>>(name: S) -> Self {
        Self {
            password_env_var: name.into(),
            ..Default::default()
        }
    }

    /// Secret read from a file
    pub fn file<S: Into<String>>(path: S) -> Self {
        Self {
            password_file: path.into(),
            ..Default::default()
        }
    }

    /// True when no source is configured
    pub fn is_empty(&self) -> bool {
        self.password.is_empty() && self.password_env_var.is_empty() && self.password_file.is_empty()
    }

    /// Read the secret. The returned buffer is wiped when dropped.
    ///
    /// An unset environment variable yields an empty secret, a missing file is
    /// an error.
    pub fn fetch(&self) -> Result<Zeroizing<String>> {
        if !self.password.is_empty() {
            return Ok(Zeroizing::new(self.password.clone()));
        }

        if !self.password_env_var.is_empty() {
            let value = std::env::var(&self.password_env_var).unwrap_or_default();
            std::env::remove_var(&self.password_env_var);
            return Ok(Zeroizing::new(value));
        }

        if !self.password_file.is_empty() {
            let mut content = Zeroizing::new(fs::read_to_string(&self.password_file)?);
            let trimmed = content.trim_end_matches(['\r', '\n']).len();
            content.truncate(trimmed);
            return Ok(content);
        }

        Ok(Zeroizing::new(String::new()))
    }
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.password.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("CredentialConfig")
            .field("password", &password)
            .field("password_env_var", &self.password_env_var)
            .field("password_file", &self.password_file)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_literal_takes_precedence() {
        let credential = CredentialConfig {
            password: "literal".into(),
            password_env_var: "BLUEPRINT_KAFKA_UNUSED".into(),
            password_file: "/does/not/exist".into(),
        };
        assert_eq!(credential.fetch().unwrap().as_str(), "literal");
    }

    #[test]
    fn test_env_var_is_cleared_after_read() {
        let name = "BLUEPRINT_KAFKA_TEST_SECRET";
        std::env::set_var(name, "from-env");

        let credential = CredentialConfig::env(name);
        assert_eq!(credential.fetch().unwrap().as_str(), "from-env");
        assert!(std::env::var(name).is_err());
        assert_eq!(credential.fetch().unwrap().as_str(), "");
    }

    #[test]
    fn test_file_source_trims_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();

        let credential = CredentialConfig::file(file.path().to_string_lossy());
        assert_eq!(credential.fetch().unwrap().as_str(), "from-file");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let credential = CredentialConfig::file("/definitely/not/here/secret.txt");
        assert!(credential.fetch().is_err());
    }

    #[test]
    fn test_debug_redacts_literal() {
        let rendered = format!("{:?}", CredentialConfig::literal("hunter2"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
