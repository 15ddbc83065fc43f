//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__RETRY__MAX_ATTEMPTS=5`），
//! 最后兼容旧部署的环境变量（`OPENAI_DEFAULT_MODEL` / `OPENAI_TEMPERATURE` / `OPENAI_MAX_TOKENS` / `MCP_PROXY_URL`）。
//!
//! 加载结果经 `RelayConfig::snapshot` 校验后得到不可变的 `RelaySettings`，每个逻辑请求持有一份 Arc 快照，
//! 没有全局单例，也没有就地 reload。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 配置加载 / 校验错误
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Config load failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub agent: AgentSection,
    pub endpoints: EndpointsSection,
    pub retry: RetrySection,
}

/// [agent] 段：主模型、备选模型与模型参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub model: String,
    pub fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub instructions: String,
    pub enable_guardrails: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: "gpt-4.1-mini".to_string(),
            fallback_models: Vec::new(),
            temperature: 0.1,
            max_tokens: 500_000,
            instructions: "You are a helpful assistant that uses tools to answer user questions."
                .to_string(),
            enable_guardrails: true,
        }
    }
}

/// [endpoints] 段：MCP 代理端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointsSection {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl Default for EndpointsSection {
    fn default() -> Self {
        Self {
            primary: "https://sequencer-v2.heurist.xyz/mcp/sse".to_string(),
            fallbacks: Vec::new(),
        }
    }
}

/// [retry] 段：单候选重试次数、退避基数 / 抖动 / 上限（毫秒）、整体重试次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    /// 未设置时不封顶
    pub max_delay_ms: Option<u64>,
    pub top_level_retries: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            jitter_ms: 1000,
            max_delay_ms: None,
            top_level_retries: 2,
        }
    }
}

/// 校验后的不可变配置快照
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub agent: AgentSettings,
    pub endpoints: EndpointSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub model: String,
    pub fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub instructions: String,
    pub enable_guardrails: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
    pub max_delay: Option<Duration>,
    pub top_level_retries: u32,
}

impl RelaySettings {
    /// 以默认参数构造快照（无 fallback），其余字段用 with_* 调整
    pub fn new(model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let defaults = RelayConfig::default();
        Self {
            agent: AgentSettings {
                model: model.into(),
                fallback_models: Vec::new(),
                temperature: defaults.agent.temperature,
                max_tokens: defaults.agent.max_tokens,
                instructions: defaults.agent.instructions,
                enable_guardrails: defaults.agent.enable_guardrails,
            },
            endpoints: EndpointSettings {
                primary: endpoint.into(),
                fallbacks: Vec::new(),
            },
            retry: RetrySettings {
                max_attempts: defaults.retry.max_attempts,
                base_delay: Duration::from_millis(defaults.retry.base_delay_ms),
                jitter: Duration::from_millis(defaults.retry.jitter_ms),
                max_delay: None,
                top_level_retries: defaults.retry.top_level_retries,
            },
        }
    }

    pub fn with_fallback_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent.fallback_models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints.fallbacks = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.retry.max_attempts = max_attempts.max(1);
        self.retry.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.retry.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.retry.max_delay = max_delay;
        self
    }

    pub fn with_top_level_retries(mut self, retries: u32) -> Self {
        self.retry.top_level_retries = retries;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.agent.instructions = instructions.into();
        self
    }
}

impl RelayConfig {
    /// 校验并生成不可变快照
    pub fn snapshot(&self) -> Result<Arc<RelaySettings>, SettingsError> {
        if self.agent.model.trim().is_empty() {
            return Err(SettingsError::Invalid("agent.model must not be empty".into()));
        }
        if self.endpoints.primary.trim().is_empty() {
            return Err(SettingsError::Invalid("endpoints.primary must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(SettingsError::Invalid(format!(
                "agent.temperature must be within [0, 2], got {}",
                self.agent.temperature
            )));
        }

        Ok(Arc::new(RelaySettings {
            agent: AgentSettings {
                model: self.agent.model.clone(),
                fallback_models: non_blank(&self.agent.fallback_models),
                temperature: self.agent.temperature,
                max_tokens: self.agent.max_tokens,
                instructions: self.agent.instructions.clone(),
                enable_guardrails: self.agent.enable_guardrails,
            },
            endpoints: EndpointSettings {
                primary: self.endpoints.primary.clone(),
                fallbacks: non_blank(&self.endpoints.fallbacks),
            },
            retry: RetrySettings {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                jitter: Duration::from_millis(self.retry.jitter_ms),
                max_delay: self.retry.max_delay_ms.map(Duration::from_millis),
                top_level_retries: self.retry.top_level_retries,
            },
        }))
    }

    /// 兼容旧部署的环境变量；lookup 注入便于测试
    pub fn apply_legacy_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("OPENAI_DEFAULT_MODEL") {
            self.agent.model = model;
        }
        if let Some(value) = lookup("OPENAI_TEMPERATURE") {
            self.agent.temperature = value.trim().parse().map_err(|_| SettingsError::InvalidEnv {
                var: "OPENAI_TEMPERATURE",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("OPENAI_MAX_TOKENS") {
            self.agent.max_tokens = value.trim().parse().map_err(|_| SettingsError::InvalidEnv {
                var: "OPENAI_MAX_TOKENS",
                value: value.clone(),
            })?;
        }
        if let Some(url) = lookup("MCP_PROXY_URL") {
            self.endpoints.primary = url;
        }
        Ok(())
    }
}

/// 去掉空白项：`RELAY__AGENT__FALLBACK_MODELS=""` 会被解析成 `[""]`
fn non_blank(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// 从 config 目录加载配置，环境变量 RELAY__* 与旧环境变量可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 RELAY__*（双下划线表示嵌套键，列表用逗号分隔）
/// 4. 叠加旧环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<RelayConfig, SettingsError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("agent.fallback_models")
            .with_list_parse_key("endpoints.fallbacks"),
    );

    let mut cfg: RelayConfig = builder.build()?.try_deserialize()?;
    cfg.apply_legacy_overrides(|key| std::env::var(key).ok())?;
    Ok(cfg)
}

/// 加载并校验，直接得到快照
pub fn load_settings(config_path: Option<PathBuf>) -> Result<Arc<RelaySettings>, SettingsError> {
    load_config(config_path)?.snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_snapshot() {
        let settings = RelayConfig::default().snapshot().unwrap();
        assert_eq!(settings.agent.model, "gpt-4.1-mini");
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.base_delay, Duration::from_secs(1));
        assert_eq!(settings.retry.jitter, Duration::from_secs(1));
        assert_eq!(settings.retry.max_delay, None);
        assert_eq!(settings.retry.top_level_retries, 2);
        assert!(settings.agent.enable_guardrails);
    }

    #[test]
    fn test_snapshot_rejects_zero_attempts() {
        let mut cfg = RelayConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(matches!(cfg.snapshot(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_snapshot_rejects_empty_endpoint() {
        let mut cfg = RelayConfig::default();
        cfg.endpoints.primary = "  ".into();
        assert!(cfg.snapshot().is_err());
    }

    #[test]
    fn test_snapshot_drops_blank_fallbacks() {
        let mut cfg = RelayConfig::default();
        cfg.agent.fallback_models = vec!["".into()];
        cfg.endpoints.fallbacks = vec![" https://e2/sse ".into(), "  ".into()];
        let settings = cfg.snapshot().unwrap();
        assert!(settings.agent.fallback_models.is_empty());
        assert_eq!(settings.endpoints.fallbacks, vec!["https://e2/sse"]);
    }

    #[test]
    fn test_settings_builders() {
        let settings = RelaySettings::new("model-a", "https://e1/sse")
            .with_fallback_models(["model-b"])
            .with_instructions("Answer in one sentence.")
            .with_retry(0, Duration::from_millis(10));
        assert_eq!(settings.agent.instructions, "Answer in one sentence.");
        assert_eq!(settings.agent.fallback_models, vec!["model-b"]);
        assert_eq!(settings.retry.max_attempts, 1);
    }

    #[test]
    fn test_legacy_overrides() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_DEFAULT_MODEL", "gpt-4o"),
            ("OPENAI_TEMPERATURE", "0.7"),
            ("OPENAI_MAX_TOKENS", "1000"),
            ("MCP_PROXY_URL", "https://proxy.example/sse"),
        ]
        .into_iter()
        .collect();
        let mut cfg = RelayConfig::default();
        cfg.apply_legacy_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.agent.model, "gpt-4o");
        assert!((cfg.agent.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(cfg.agent.max_tokens, 1000);
        assert_eq!(cfg.endpoints.primary, "https://proxy.example/sse");
    }

    #[test]
    fn test_legacy_override_invalid_number() {
        let mut cfg = RelayConfig::default();
        let err = cfg
            .apply_legacy_overrides(|k| (k == "OPENAI_MAX_TOKENS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidEnv { var: "OPENAI_MAX_TOKENS", .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[agent]
model = "model-a"
fallback_models = ["model-b", "model-c"]

[endpoints]
primary = "https://e1/sse"
fallbacks = ["https://e2/sse"]

[retry]
max_attempts = 5
base_delay_ms = 250
max_delay_ms = 8000
top_level_retries = 0
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.fallback_models, vec!["model-b", "model-c"]);
        assert_eq!(cfg.endpoints.fallbacks, vec!["https://e2/sse"]);

        let settings = cfg.snapshot().unwrap();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(250));
        assert_eq!(settings.retry.max_delay, Some(Duration::from_secs(8)));
        assert_eq!(settings.retry.top_level_retries, 0);
    }
}
