//! Process configuration
//!
//! Every section has a `Default`; [`Settings::from_env`] overlays the
//! `LABKERNEL_*` environment variables on top.

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::kernel::KernelConfig;
use crate::transcript::CorruptPolicy;

/// Default Ollama server
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Code run in every new project's kernel
pub const DEFAULT_INIT_CODE: &str = "dataframes = {}";

/// Transcript storage settings
#[derive(Debug, Clone)]
pub struct TranscriptConfig {
    pub dir: PathBuf,
    pub corrupt_policy: CorruptPolicy,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("notebooks"),
            corrupt_policy: CorruptPolicy::Archive,
        }
    }
}

/// All settings of a running orchestrator
#[derive(Debug, Clone)]
pub struct Settings {
    pub kernel: KernelConfig,
    pub agent: AgentConfig,
    pub transcript: TranscriptConfig,
    pub ollama_url: String,
    /// Upper bound on a single provider request
    pub provider_timeout: Duration,
    pub system_prompt_path: PathBuf,
    /// Code run at session initiation; `None` skips it
    pub init_code: Option<String>,
    /// OTLP collector for span export; console logging only when `None`
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            agent: AgentConfig::default(),
            transcript: TranscriptConfig::default(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            provider_timeout: Duration::from_secs(300),
            system_prompt_path: PathBuf::from("sysprompt.txt"),
            init_code: Some(DEFAULT_INIT_CODE.to_string()),
            otlp_endpoint: None,
        }
    }
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl Settings {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(dir) = lookup("LABKERNEL_TRANSCRIPT_DIR") {
            settings.transcript.dir = PathBuf::from(dir);
        }
        if let Some(policy) = lookup("LABKERNEL_CORRUPT_POLICY") {
            settings.transcript.corrupt_policy =
                policy.parse().map_err(|reason| ConfigError::Invalid {
                    key: "LABKERNEL_CORRUPT_POLICY",
                    value: policy.clone(),
                    reason,
                })?;
        }
        if let Some(program) = lookup("LABKERNEL_KERNEL_PROGRAM") {
            settings.kernel.program = program;
        }
        if let Some(secs) = lookup("LABKERNEL_MESSAGE_TIMEOUT_SECS") {
            settings.kernel.message_timeout = parse_secs("LABKERNEL_MESSAGE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("LABKERNEL_STARTUP_TIMEOUT_SECS") {
            settings.kernel.startup_timeout = parse_secs("LABKERNEL_STARTUP_TIMEOUT_SECS", &secs)?;
        }
        if let Some(rounds) = lookup("LABKERNEL_MAX_ROUNDS") {
            settings.agent.max_rounds = parse_number("LABKERNEL_MAX_ROUNDS", &rounds)?;
        }
        if let Some(model) = lookup("LABKERNEL_MODEL") {
            settings.agent.model = model;
        }
        if let Some(secs) = lookup("LABKERNEL_PROVIDER_TIMEOUT_SECS") {
            settings.provider_timeout = parse_secs("LABKERNEL_PROVIDER_TIMEOUT_SECS", &secs)?;
        }
        if let Some(path) = lookup("LABKERNEL_SYSTEM_PROMPT_PATH") {
            settings.system_prompt_path = PathBuf::from(path);
        }
        if let Some(flag) = lookup("LABKERNEL_ENABLE_EXECUTION") {
            settings.agent.enable_execution = parse_bool("LABKERNEL_ENABLE_EXECUTION", &flag)?;
        }
        if let Some(url) = lookup("OLLAMA_URL") {
            settings.ollama_url = url;
        }
        if let Some(code) = lookup("LABKERNEL_INIT_CODE") {
            settings.init_code = Some(code).filter(|c| !c.trim().is_empty());
        }
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            settings.otlp_endpoint = Some(endpoint).filter(|e| !e.trim().is_empty());
        }

        Ok(settings)
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_number(key, value)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = from_pairs(&[]).unwrap();
        assert_eq!(settings.transcript.dir, PathBuf::from("notebooks"));
        assert_eq!(settings.transcript.corrupt_policy, CorruptPolicy::Archive);
        assert_eq!(settings.kernel.program, "python3");
        assert_eq!(settings.kernel.message_timeout, Duration::from_secs(20));
        assert_eq!(settings.kernel.startup_timeout, Duration::from_secs(30));
        assert_eq!(settings.agent.max_rounds, 10);
        assert_eq!(settings.agent.model, "qwen3");
        assert_eq!(settings.provider_timeout, Duration::from_secs(300));
        assert_eq!(settings.system_prompt_path, PathBuf::from("sysprompt.txt"));
        assert!(settings.agent.enable_execution);
        assert_eq!(settings.ollama_url, "http://localhost:11434");
        assert_eq!(settings.init_code.as_deref(), Some("dataframes = {}"));
        assert!(settings.otlp_endpoint.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = from_pairs(&[
            ("LABKERNEL_TRANSCRIPT_DIR", "/var/lib/labkernel"),
            ("LABKERNEL_CORRUPT_POLICY", "fail"),
            ("LABKERNEL_MESSAGE_TIMEOUT_SECS", "5"),
            ("LABKERNEL_MAX_ROUNDS", "3"),
            ("LABKERNEL_ENABLE_EXECUTION", "off"),
            ("LABKERNEL_INIT_CODE", ""),
            ("OLLAMA_URL", "http://gpu-box:11434"),
        ])
        .unwrap();
        assert_eq!(settings.transcript.dir, PathBuf::from("/var/lib/labkernel"));
        assert_eq!(settings.transcript.corrupt_policy, CorruptPolicy::Fail);
        assert_eq!(settings.kernel.message_timeout, Duration::from_secs(5));
        assert_eq!(settings.agent.max_rounds, 3);
        assert!(!settings.agent.enable_execution);
        assert!(settings.init_code.is_none());
        assert_eq!(settings.ollama_url, "http://gpu-box:11434");
    }

    #[test]
    fn test_invalid_values() {
        let err = from_pairs(&[("LABKERNEL_MAX_ROUNDS", "many")]).unwrap_err();
        assert!(err.to_string().contains("LABKERNEL_MAX_ROUNDS"));

        assert!(from_pairs(&[("LABKERNEL_MESSAGE_TIMEOUT_SECS", "0")]).is_err());
        assert!(from_pairs(&[("LABKERNEL_ENABLE_EXECUTION", "maybe")]).is_err());
        assert!(from_pairs(&[("LABKERNEL_CORRUPT_POLICY", "keep")]).is_err());
    }
}
