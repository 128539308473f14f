//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWITCHBOARD__*` 覆盖
//! （双下划线表示嵌套，如 `SWITCHBOARD__DEBOUNCE__WINDOW_MS=500`）。
//! 所有字段都有默认值，与编排层的默认常量一致，空配置即可启动。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::ProviderEndpoint;

/// 应用配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    /// [[endpoints]]：可调用的 (provider, model) 列表
    pub endpoints: Vec<ProviderEndpoint>,
    /// [providers.<name>]：提供方连接参数
    pub providers: HashMap<String, ProviderSection>,
    pub resilience: ResilienceSection,
    pub cache: CacheSection,
    pub debounce: DebounceSection,
    pub queue: QueueSection,
    pub orchestrator: OrchestratorSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// stdin 适配器使用的会话 ID
    pub conversation_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "switchboard".to_string(),
            conversation_id: "local".to_string(),
        }
    }
}

/// 提供方类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
    /// 脚本化回显（本地演示 / 测试）
    Scripted,
}

/// [providers.<name>] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub kind: ProviderKind,
    pub base_url: String,
    /// 存放 API Key 的环境变量名（不把密钥写进配置文件）
    pub api_key_env: Option<String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenaiCompatible,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: None,
        }
    }
}

/// [resilience] 段：重试延迟、冷却阶梯、计费短语词表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    /// 短暂故障后同端点立即重试前的固定等待（毫秒）
    pub immediate_retry_delay_ms: u64,
    /// 同端点立即重试次数
    pub immediate_retries: u32,
    pub transient_ladder_secs: Vec<u64>,
    pub billing_ladder_secs: Vec<u64>,
    pub auth_cooldown_secs: u64,
    /// 计费短语（正则，大小写不敏感）
    pub billing_patterns: Vec<String>,
    /// 每个端点保留的失败类别历史条数
    pub history_len: usize,
    /// HALF_OPEN 探测许可的租约（秒），持有者超时未回报则允许新的探测
    pub probe_lease_secs: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            immediate_retry_delay_ms: 1500,
            immediate_retries: 1,
            transient_ladder_secs: vec![60, 300, 3600],
            billing_ladder_secs: vec![5 * 3600, 12 * 3600, 24 * 3600],
            auth_cooldown_secs: 6 * 3600,
            billing_patterns: default_billing_patterns(),
            history_len: 16,
            probe_lease_secs: 300,
        }
    }
}

fn default_billing_patterns() -> Vec<String> {
    vec![
        r"insufficient[_ ](quota|funds|balance|credits?)".into(),
        r"exceeded your current quota".into(),
        r"billing[_ ](hard[_ ])?limit".into(),
        r"payment required".into(),
        r"credit balance is too low".into(),
        r"account (is )?(suspended|deactivated) .*(billing|payment)".into(),
        r"余额不足".into(),
        r"账户欠费".into(),
    ]
}

/// [cache] 段：幂等缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl CacheSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// [debounce] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceSection {
    pub window_ms: u64,
}

impl Default for DebounceSection {
    fn default() -> Self {
        Self { window_ms: 800 }
    }
}

impl DebounceSection {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// [queue] 段：离线队列分级重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub retry_stages_secs: Vec<u64>,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            retry_stages_secs: vec![10, 60, 600],
        }
    }
}

impl QueueSection {
    pub fn schedule(&self) -> Vec<Duration> {
        self.retry_stages_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }
}

/// [orchestrator] 段：超时、反思、系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 单个请求的墙钟上限（安全阀，不是工具轮数上限）
    pub request_deadline_secs: u64,
    /// 单次提供方调用超时
    pub call_timeout_secs: u64,
    /// 工具未声明超时时使用的默认值
    pub tool_timeout_secs: u64,
    /// 是否在返回前做一次自我反思
    pub reflect: bool,
    pub system_prompt: String,
    /// 最终回复按多少字符切片推送 partial_output
    pub chunk_chars: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            request_deadline_secs: 600,
            call_timeout_secs: 120,
            tool_timeout_secs: 30,
            reflect: false,
            system_prompt: "You are a helpful assistant. To use a tool reply with exactly one JSON object \
                            {\"tool\": \"name\", \"args\": {...}}; otherwise reply with the final answer."
                .to_string(),
            chunk_chars: 24,
        }
    }
}

impl OrchestratorSection {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// 从 config 目录加载配置，环境变量 SWITCHBOARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWITCHBOARD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
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
        config::Environment::with_prefix("SWITCHBOARD")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
