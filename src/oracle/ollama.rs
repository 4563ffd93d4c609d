//! Ollama-backed reasoning oracle.
//!
//! Plans are requested through `/api/generate` with a non-streaming body.
//! `/api/tags` is used as a cheap liveness probe.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{OracleError, PlanRequest, ReasoningOracle};

/// Timeout for the liveness probe, independent of the generation timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const SYSTEM_PROMPT: &str = "You are the planner of an automation loop. \
Decompose the task into a few concrete actions, or decline. Answer with JSON only.";

/// `[oracle]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// When false no oracle is attached and `task` actions fail.
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".into(),
            model: "mistral".into(),
            timeout_secs: 120,
        }
    }
}

/// Client for the Ollama REST API.
#[derive(Debug, Clone)]
pub struct OllamaOracle {
    config: OracleConfig,
}

impl OllamaOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Check that the server answers and list its local models.
    pub fn probe(&self) -> Result<Vec<String>, OracleError> {
        let url = format!("{}/api/tags", self.config.base_url);
        let agent = ureq::AgentBuilder::new().timeout(PROBE_TIMEOUT).build();

        let resp = agent.get(&url).call().map_err(|e| OracleError::Unavailable {
            detail: format!("{url}: {e}"),
        })?;
        let body = resp.into_string().map_err(|e| OracleError::Parse {
            message: e.to_string(),
        })?;
        let json: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| OracleError::Parse {
                message: e.to_string(),
            })?;

        Ok(json["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Whether `models` (from [`probe`](Self::probe)) contains the configured
    /// model, with or without a `:tag` suffix.
    pub fn has_model(&self, models: &[String]) -> bool {
        let target = &self.config.model;
        models
            .iter()
            .any(|m| m == target || m.split(':').next() == Some(target.as_str()))
    }

    /// Single-turn completion.
    pub fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, OracleError> {
        let url = format!("{}/api/generate", self.config.base_url);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build();

        let mut body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
        });
        if let Some(sys) = system {
            body["system"] = serde_json::Value::String(sys.to_string());
        }

        let resp = agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(body)
            .map_err(|e| self.map_transport(e))?;

        let json: serde_json::Value = resp.into_json().map_err(|e| OracleError::Parse {
            message: e.to_string(),
        })?;

        json["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OracleError::Parse {
                message: "missing 'response' field".into(),
            })
    }

    fn map_transport(&self, err: ureq::Error) -> OracleError {
        match err {
            ureq::Error::Status(code, resp) => OracleError::RequestFailed {
                message: format!(
                    "HTTP {code}: {}",
                    resp.into_string().unwrap_or_default().trim()
                ),
            },
            ureq::Error::Transport(t) => {
                let message = t.to_string();
                if message.contains("timed out") {
                    OracleError::Timeout {
                        timeout_secs: self.config.timeout_secs,
                    }
                } else if matches!(t.kind(), ureq::ErrorKind::ConnectionFailed | ureq::ErrorKind::Dns) {
                    OracleError::Unavailable {
                        detail: format!("{}: {message}", self.config.base_url),
                    }
                } else {
                    OracleError::RequestFailed { message }
                }
            }
        }
    }
}

impl ReasoningOracle for OllamaOracle {
    fn name(&self) -> &str {
        "ollama"
    }

    fn request_plan(
        &self,
        request: &PlanRequest,
        action_docs: &[(&str, &str)],
    ) -> Result<String, OracleError> {
        let prompt = request.to_prompt(action_docs);
        tracing::debug!(model = %self.config.model, chars = prompt.len(), "requesting plan");
        self.generate(&prompt, Some(SYSTEM_PROMPT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_partial_toml() {
        let cfg: OracleConfig = toml::from_str("model = \"llama3\"").unwrap();
        assert_eq!(cfg.model, "llama3");
        assert_eq!(cfg.base_url, "http://localhost:11434");
        assert_eq!(cfg.timeout_secs, 120);
        assert!(cfg.enabled);
    }

    #[test]
    fn model_match_ignores_tag() {
        let oracle = OllamaOracle::new(OracleConfig::default());
        assert!(oracle.has_model(&["mistral:latest".into()]));
        assert!(!oracle.has_model(&["llama3:8b".into()]));
    }

    #[test]
    fn unreachable_server_is_unavailable() {
        let oracle = OllamaOracle::new(OracleConfig {
            base_url: "http://127.0.0.1:1".into(),
            ..OracleConfig::default()
        });
        assert!(matches!(oracle.probe(), Err(OracleError::Unavailable { .. })));
    }
}
