//! Configuration system for EISLab.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/eislab/config.toml` and/or `.eislab/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EislabConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

impl EislabConfig {
    /// Warnings from every section, prefixed with the section name.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for w in self.llm.validate() {
            warnings.push(format!("[llm] {}", w));
        }
        for w in self.retry.validate() {
            warnings.push(format!("[retry] {}", w));
        }
        if self.history.digest_limit == 0 {
            warnings.push("[history] digest_limit is 0; historical context is off".to_string());
        }
        let crossover = self.calibration.crossover_hz;
        if crossover.is_nan() || crossover <= 0.0 {
            warnings.push(format!(
                "[calibration] crossover_hz ({}) is not positive; every frequency uses band 2",
                crossover
            ));
        }
        warnings
    }
}

/// Completion service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name. Only "gemini" is supported.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Inline API key; takes precedence over `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.4,
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.provider != "gemini" {
            warnings.push(format!(
                "provider '{}' is not supported; requests use the Gemini API",
                self.provider
            ));
        }
        if self.model.trim().is_empty() {
            warnings.push("model is empty".to_string());
        }
        if self.temperature < 0.0 || self.temperature > 2.0 {
            warnings.push(format!(
                "temperature ({}) is outside the typical range 0.0-2.0",
                self.temperature
            ));
        }
        warnings
    }

    /// The credential to use: the inline key, else the variable named by
    /// `api_key_env`. Blank values count as absent.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Bounded retry policy for completion calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_attempts == 0 {
            warnings.push("max_attempts is 0; treated as a single attempt".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "backoff_multiplier ({}) is below 1.0; delays will shrink",
                self.backoff_multiplier
            ));
        }
        warnings
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the failed attempt numbered `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.max(0.0).round() as u64)
    }
}

/// Saved-run storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Owner scope runs are saved under.
    pub owner: String,
    /// Number of prior runs included in the historical digest.
    pub digest_limit: usize,
    /// Storage root; defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            owner: "local".to_string(),
            digest_limit: crate::history::retriever::DEFAULT_DIGEST_LIMIT,
            data_dir: None,
        }
    }
}

impl HistoryConfig {
    /// The configured storage root, falling back to `<data dir>/history`.
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| project_dirs().map(|d| d.data_dir().join("history")))
            .unwrap_or_else(|| PathBuf::from(".eislab").join("history"))
    }
}

/// Device calibration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Frequency at which magnitude correction switches from band 1 to band 2.
    pub crossover_hz: f64,
    /// Default coefficients applied when no calibration file is given.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub coefficients: BTreeMap<String, f64>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            crossover_hz: 1000.0,
            coefficients: BTreeMap::new(),
        }
    }
}

pub fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "eislab", "eislab")
}

/// Load configuration from all sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `EISLAB_`)
/// 3. Workspace-local config (`.eislab/config.toml`)
/// 4. User config (`~/.config/eislab/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EislabConfig>,
) -> Result<EislabConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EislabConfig::default()));

    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // EISLAB_LLM__MODEL, EISLAB_RETRY__MAX_ATTEMPTS, ...
    figment = figment.merge(Env::prefixed("EISLAB_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".eislab").join("config.toml")
}

/// Check whether any EISLab configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(dirs) = project_dirs()
        && dirs.config_dir().join("config.toml").exists()
    {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EislabConfig::default();
        assert_eq!(config.llm.provider, "gemini");
        assert_eq!(config.llm.api_key_env, "GEMINI_API_KEY");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.history.owner, "local");
        assert_eq!(config.history.digest_limit, 5);
        assert_eq!(config.calibration.crossover_hz, 1000.0);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_backoff_schedule_doubles() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_for(1), Duration::from_secs(1));
        assert_eq!(retry.backoff_for(2), Duration::from_secs(2));
        assert_eq!(retry.backoff_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let retry = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(retry.attempts(), 1);
        assert_eq!(retry.validate().len(), 1);
    }

    #[test]
    fn test_llm_validate_warnings() {
        let config = LlmConfig {
            provider: "openai".into(),
            temperature: 3.0,
            ..Default::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("openai"));
    }

    #[test]
    fn test_inline_api_key_wins() {
        let config = LlmConfig {
            api_key: Some("inline".into()),
            api_key_env: "EISLAB_TEST_UNSET_VARIABLE".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("inline"));

        let config = LlmConfig {
            api_key: Some("   ".into()),
            api_key_env: "EISLAB_TEST_UNSET_VARIABLE".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key(), None);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = EislabConfig::default();
        config.calibration.coefficients.insert("MAG1_A".into(), 1.1);
        let toml_str = toml::to_string(&config).unwrap();
        let back: EislabConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.llm.model, config.llm.model);
        assert_eq!(back.calibration.coefficients, config.calibration.coefficients);
    }

    #[test]
    fn test_load_config_workspace_file() {
        let dir = TempDir::new().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "[llm]\nmodel = \"gemini-test\"\n\n[history]\nowner = \"greenhouse\"\ndigest_limit = 3\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.llm.model, "gemini-test");
        assert_eq!(config.history.owner, "greenhouse");
        assert_eq!(config.history.digest_limit, 3);
        // Untouched sections keep defaults.
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config_exists(Some(dir.path())));
    }

    #[test]
    fn test_load_config_overrides_win() {
        let mut overrides = EislabConfig::default();
        overrides.history.owner = "cli".into();
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.history.owner, "cli");
    }

    #[test]
    fn test_explicit_data_dir() {
        let history = HistoryConfig {
            data_dir: Some(PathBuf::from("/tmp/eis")),
            ..Default::default()
        };
        assert_eq!(history.resolve_data_dir(), PathBuf::from("/tmp/eis"));
    }
}
