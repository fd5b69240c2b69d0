use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub orchestrator: OrchestratorConfig,
    pub model: ModelConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CHATLOOP_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CHATLOOP_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            orchestrator: OrchestratorConfig::from_env_profiled(p),
            model: ModelConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  orchestrator: max_iterations={}, instructions={} chars",
            self.orchestrator.max_iterations,
            self.orchestrator.instructions.len()
        );
        tracing::info!(
            "  model:        temperature={}, max_tokens={}",
            self.model.temperature,
            self.model.max_tokens
        );
    }
}

// ── Orchestrator ──────────────────────────────────────────────

/// Default number of model turns a single prompt may take.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Iteration budget applied when a prompt does not set its own.
    pub max_iterations: usize,
    /// Instructions handed to the provider when the thread is created.
    pub instructions: String,
}

impl OrchestratorConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_iterations: profiled_env_usize(p, "CHATLOOP_MAX_ITERATIONS", DEFAULT_MAX_ITERATIONS),
            instructions: profiled_env_or(p, "CHATLOOP_INSTRUCTIONS", ""),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            instructions: String::new(),
        }
    }
}

// ── Model sampling ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            temperature: profiled_env_or(p, "CHATLOOP_TEMPERATURE", "0.0")
                .parse()
                .unwrap_or(0.0),
            max_tokens: profiled_env_u32(p, "CHATLOOP_MAX_TOKENS", 4096),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = Config::for_profile("NOSUCHPROFILE_DEFAULTS");
        assert_eq!(config.profile_label(), "NOSUCHPROFILE_DEFAULTS");
        assert!(config.orchestrator.max_iterations > 0);
        assert!(config.model.max_tokens > 0);
    }

    #[test]
    fn test_profiled_key_wins_over_plain_key() {
        env::set_var("CFGTEST_PROFILED_KEY", "plain");
        env::set_var("STAGING_CFGTEST_PROFILED_KEY", "staged");
        assert_eq!(
            profiled_env_opt("STAGING", "CFGTEST_PROFILED_KEY").as_deref(),
            Some("staged")
        );
        assert_eq!(
            profiled_env_opt("", "CFGTEST_PROFILED_KEY").as_deref(),
            Some("plain")
        );
        assert_eq!(
            profiled_env_opt("OTHER", "CFGTEST_PROFILED_KEY").as_deref(),
            Some("plain")
        );
    }

    #[test]
    fn test_unparseable_number_falls_back_to_default() {
        env::set_var("CFGTEST_BAD_NUMBER", "not-a-number");
        assert_eq!(profiled_env_usize("", "CFGTEST_BAD_NUMBER", 7), 7);
    }

    #[test]
    fn test_empty_value_is_treated_as_unset() {
        env::set_var("CFGTEST_EMPTY", "");
        assert_eq!(profiled_env_or("", "CFGTEST_EMPTY", "fallback"), "fallback");
    }

    #[test]
    fn test_default_profile_label() {
        assert_eq!(Config::default().profile_label(), "default");
    }

    #[test]
    fn test_profiled_values_reach_sections() {
        env::set_var("CFGTESTPROFILE_CHATLOOP_MAX_ITERATIONS", "4");
        env::set_var("CFGTESTPROFILE_CHATLOOP_MAX_TOKENS", "512");
        load_dotenv();
        let config = Config::for_profile("cfgtestprofile");
        assert_eq!(config.profile, "CFGTESTPROFILE");
        assert_eq!(config.orchestrator.max_iterations, 4);
        assert_eq!(config.model.max_tokens, 512);
        config.log_summary();
    }
}
