use std::{env, path::PathBuf};

use thiserror::Error;

use crate::prediction::OutputActivation;
use crate::preprocess::Normalization;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_BODY_LIMIT_MB: usize = 5;
const DEFAULT_MODEL_PATH: &str = "./model/frozen_graph.pb";
const DEFAULT_CLASS_LIST_PATH: &str = "./model/class_list.txt";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Credentials and endpoint for the generative-text service.
#[derive(Clone)]
pub struct AssistantConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl std::fmt::Debug for AssistantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

/// Startup configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub model_path: PathBuf,
    pub class_list_path: PathBuf,
    pub model_url: Option<String>,
    pub class_list_url: Option<String>,
    pub input_op: String,
    pub output_op: String,
    pub input_size: (u32, u32),
    pub normalization: Normalization,
    pub activation: OutputActivation,
    pub service_name: String,
    pub diagnosis_domain: String,
    pub assistant: Option<AssistantConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(&var, "PORT", DEFAULT_PORT, "a valid number between 0 and 65535")?;
        let body_limit_mb: usize =
            parse_or(&var, "BODY_LIMIT_MB", DEFAULT_BODY_LIMIT_MB, "a valid integer")?;
        let body_limit_bytes = body_limit_mb
            .checked_mul(1024 * 1024)
            .ok_or(ConfigError::Invalid {
                name: "BODY_LIMIT_MB",
                expected: "a size in megabytes that fits in memory",
                value: body_limit_mb.to_string(),
            })?;

        let width: u32 = parse_or(&var, "INPUT_WIDTH", 224, "a positive integer")?;
        let height: u32 = parse_or(&var, "INPUT_HEIGHT", 224, "a positive integer")?;
        if width == 0 || height == 0 {
            return Err(ConfigError::Invalid {
                name: "INPUT_WIDTH/INPUT_HEIGHT",
                expected: "a positive integer",
                value: format!("{width}x{height}"),
            });
        }

        let normalization = match var("NORMALIZATION") {
            None => Normalization::unit(),
            Some(name) => Normalization::from_name(&name).ok_or(ConfigError::Invalid {
                name: "NORMALIZATION",
                expected: "one of unit, symmetric, imagenet, raw",
                value: name,
            })?,
        };

        let activation = match var("OUTPUT_ACTIVATION") {
            None => OutputActivation::None,
            Some(name) => OutputActivation::from_name(&name).ok_or(ConfigError::Invalid {
                name: "OUTPUT_ACTIVATION",
                expected: "one of none, softmax",
                value: name,
            })?,
        };

        let assistant = var("GEMINI_API_KEY").map(|api_key| AssistantConfig {
            api_key,
            base_url: var("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.into()),
        });

        Ok(Config {
            port,
            body_limit_bytes,
            model_path: var("MODEL_PATH")
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.into())
                .into(),
            class_list_path: var("CLASS_LIST_PATH")
                .unwrap_or_else(|| DEFAULT_CLASS_LIST_PATH.into())
                .into(),
            model_url: var("MODEL_URL"),
            class_list_url: var("CLASS_LIST_URL"),
            input_op: var("MODEL_INPUT_OP").unwrap_or_else(|| "x".into()),
            output_op: var("MODEL_OUTPUT_OP").unwrap_or_else(|| "Identity".into()),
            input_size: (width, height),
            normalization,
            activation,
            service_name: var("SERVICE_NAME").unwrap_or_else(|| "Leukemia Detection API".into()),
            diagnosis_domain: var("DIAGNOSIS_DOMAIN").unwrap_or_else(|| "leukemia".into()),
            assistant,
        })
    }
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected,
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.body_limit_bytes, 5 * 1024 * 1024);
        assert_eq!(config.input_size, (224, 224));
        assert_eq!(config.input_op, "x");
        assert_eq!(config.output_op, "Identity");
        assert_eq!(config.activation, OutputActivation::None);
        assert_eq!(config.normalization, Normalization::unit());
        assert!(config.assistant.is_none());
    }

    #[test]
    fn blank_api_key_leaves_assistant_unconfigured() {
        let config = config_from(&[("GEMINI_API_KEY", "   ")]).unwrap();
        assert!(config.assistant.is_none());
    }

    #[test]
    fn api_key_enables_assistant_with_defaults() {
        let config = config_from(&[
            ("GEMINI_API_KEY", "secret"),
            ("GEMINI_BASE_URL", "http://localhost:9000/"),
        ])
        .unwrap();
        let assistant = config.assistant.unwrap();
        assert_eq!(assistant.model, "gemini-1.5-flash");
        assert_eq!(assistant.base_url, "http://localhost:9000");
        assert!(!format!("{assistant:?}").contains("secret"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = config_from(&[("PORT", "seventy")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn oversized_body_limit_is_rejected() {
        let err = config_from(&[("BODY_LIMIT_MB", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("BODY_LIMIT_MB"));

        let config = config_from(&[("BODY_LIMIT_MB", "12")]).unwrap();
        assert_eq!(config.body_limit_bytes, 12 * 1024 * 1024);
    }

    #[test]
    fn zero_resolution_is_rejected() {
        assert!(config_from(&[("INPUT_WIDTH", "0")]).is_err());
    }

    #[test]
    fn normalization_and_activation_are_selectable() {
        let config = config_from(&[
            ("NORMALIZATION", "symmetric"),
            ("OUTPUT_ACTIVATION", "softmax"),
            ("INPUT_WIDTH", "180"),
            ("INPUT_HEIGHT", "160"),
        ])
        .unwrap();
        assert_eq!(config.normalization, Normalization::symmetric());
        assert_eq!(config.activation, OutputActivation::Softmax);
        assert_eq!(config.input_size, (180, 160));

        assert!(config_from(&[("NORMALIZATION", "zscore")]).is_err());
        assert!(config_from(&[("OUTPUT_ACTIVATION", "sigmoid")]).is_err());
    }
}
