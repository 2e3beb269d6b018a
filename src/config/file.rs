use std::path::Path;

use crate::config::RunConfig;
use crate::error::ConfigError;

impl RunConfig {
    /// Parse a run configuration from YAML. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not a valid configuration.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a run configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Parse`] if it does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| format!("# Error serializing config: {e}"))
    }
}
