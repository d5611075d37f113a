use crate::error::AppError;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_VALKEY_HOST: &str = "localhost";
const DEFAULT_VALKEY_PORT: u16 = 6379;
const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
const DEFAULT_RATE_LIMIT_PER_DAY: u32 = 100;
const DEFAULT_ADMISSION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ADMISSION_QUEUE_CAPACITY: usize = 100;
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 180_000;

/// 限流窗口模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// 滑动窗口：截止点为 now - window。
    Sliding,
    /// 固定窗口：按 UTC 自然分钟/自然日分桶。
    Fixed,
}

impl WindowMode {
    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_lowercase().as_str() {
            "sliding" => Some(Self::Sliding),
            "fixed" => Some(Self::Fixed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sliding => "sliding",
            Self::Fixed => "fixed",
        }
    }
}

/// 凭据选择策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// 按配额扫描：依次探测每个 key 的限流状态。
    Quota,
    /// 纯轮询：共享计数器取模，不检查配额。
    RoundRobin,
}

impl SelectionMode {
    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_lowercase().replace('-', "_").as_str() {
            "quota" | "quota_scan" => Some(Self::Quota),
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

/// 配额存储后端。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStoreBackend {
    Valkey,
    /// 进程内存储，仅适用于单进程部署/本地调试。
    Memory,
}

impl QuotaStoreBackend {
    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_lowercase().as_str() {
            "valkey" | "redis" => Some(Self::Valkey),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub log_level: String,
    pub log_format: String,

    pub gemini_api_keys: Vec<String>,
    pub gemini_api_url: String,
    pub proxy: String,
    pub upstream_timeout_ms: u64,

    pub quota_store: QuotaStoreBackend,
    pub valkey_host: String,
    pub valkey_port: u16,
    pub valkey_password: String,
    pub valkey_db: i64,

    pub rate_limit_per_minute: u32,
    pub rate_limit_per_day: u32,
    pub rate_limit_window: WindowMode,
    pub selection_mode: SelectionMode,

    pub admission_timeout_secs: u64,
    pub admission_queue_capacity: usize,

    pub proxy_api_key: String,
    pub allow_gemini_keys_for_auth: bool,
}

/// 数值/布尔类环境变量：figment 会把 "60"/"true" 这类值预先解析成数字/布尔，
/// 这里统一收成字符串后再按字段做校验，报错时能带上变量名。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Str(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::Int(n) => n.to_string(),
            Self::Uint(n) => n.to_string(),
            Self::Float(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

/// 字符串类字段不经过 figment：其类型猜测会把 "00123456" 改写成 123456，
/// 密钥与地址必须保留原文，由 `read_strings` 直接读取。
#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(skip)]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<EnvValue>,

    #[serde(skip)]
    log_level: Option<String>,
    #[serde(skip)]
    log_format: Option<String>,

    #[serde(skip)]
    gemini_api_keys: Option<String>,
    #[serde(skip)]
    gemini_api_url: Option<String>,
    #[serde(skip)]
    proxy: Option<String>,
    #[serde(alias = "UPSTREAM_TIMEOUT_MS")]
    upstream_timeout_ms: Option<EnvValue>,

    #[serde(skip)]
    quota_store: Option<String>,
    #[serde(skip)]
    valkey_host: Option<String>,
    #[serde(alias = "VALKEY_PORT")]
    valkey_port: Option<EnvValue>,
    #[serde(skip)]
    valkey_password: Option<String>,
    #[serde(alias = "VALKEY_DB")]
    valkey_db: Option<EnvValue>,

    #[serde(alias = "RATE_LIMIT_PER_MINUTE")]
    rate_limit_per_minute: Option<EnvValue>,
    #[serde(alias = "RATE_LIMIT_PER_DAY")]
    rate_limit_per_day: Option<EnvValue>,
    #[serde(skip)]
    rate_limit_window: Option<String>,
    #[serde(skip)]
    selection_mode: Option<String>,

    #[serde(alias = "ADMISSION_TIMEOUT_SECS")]
    admission_timeout_secs: Option<EnvValue>,
    #[serde(alias = "ADMISSION_QUEUE_CAPACITY")]
    admission_queue_capacity: Option<EnvValue>,

    #[serde(skip)]
    proxy_api_key: Option<String>,
    #[serde(alias = "ALLOW_GEMINI_KEYS_FOR_AUTH")]
    allow_gemini_keys_for_auth: Option<EnvValue>,
}

impl RawEnv {
    /// 按变量名取原文；空白值视为未设置。
    fn read_strings(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        self.host = get("HOST");
        self.log_level = get("LOG_LEVEL");
        self.log_format = get("LOG_FORMAT");
        self.gemini_api_keys = get("GEMINI_API_KEYS");
        self.gemini_api_url = get("GEMINI_API_URL");
        self.proxy = get("PROXY");
        self.quota_store = get("QUOTA_STORE");
        self.valkey_host = get("VALKEY_HOST");
        self.valkey_password = get("VALKEY_PASSWORD");
        self.rate_limit_window = get("RATE_LIMIT_WINDOW");
        self.selection_mode = get("SELECTION_MODE");
        self.proxy_api_key = get("PROXY_API_KEY");
    }
}

impl Config {
    /// 读取 .env 与进程环境变量并校验。任何非法值都是启动期致命错误。
    pub fn load() -> Result<Self, AppError> {
        load_dotenv();

        let mut raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .map_err(|e| AppError::config(format!("读取环境变量失败: {e}")))?;
        raw.read_strings(|name| std::env::var(name).ok());

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnv) -> Result<Self, AppError> {
        let text = |v: Option<EnvValue>| v.map(EnvValue::into_string);

        let cfg = Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_number("PORT", text(raw.port), DEFAULT_PORT)?,
            log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
            log_format: raw.log_format.unwrap_or_else(|| "text".to_string()),
            gemini_api_keys: parse_key_list(raw.gemini_api_keys.as_deref()),
            gemini_api_url: raw.gemini_api_url
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_URL.to_string()),
            proxy: raw.proxy.unwrap_or_default(),
            upstream_timeout_ms: parse_number(
                "UPSTREAM_TIMEOUT_MS",
                text(raw.upstream_timeout_ms),
                DEFAULT_UPSTREAM_TIMEOUT_MS,
            )?,
            quota_store: parse_enum(
                "QUOTA_STORE",
                raw.quota_store,
                QuotaStoreBackend::Valkey,
                QuotaStoreBackend::parse,
            )?,
            valkey_host: raw.valkey_host.unwrap_or_else(|| DEFAULT_VALKEY_HOST.to_string()),
            valkey_port: parse_number("VALKEY_PORT", text(raw.valkey_port), DEFAULT_VALKEY_PORT)?,
            valkey_password: raw.valkey_password.unwrap_or_default(),
            valkey_db: parse_number("VALKEY_DB", text(raw.valkey_db), 0)?,
            rate_limit_per_minute: parse_number(
                "RATE_LIMIT_PER_MINUTE",
                text(raw.rate_limit_per_minute),
                DEFAULT_RATE_LIMIT_PER_MINUTE,
            )?,
            rate_limit_per_day: parse_number(
                "RATE_LIMIT_PER_DAY",
                text(raw.rate_limit_per_day),
                DEFAULT_RATE_LIMIT_PER_DAY,
            )?,
            rate_limit_window: parse_enum(
                "RATE_LIMIT_WINDOW",
                raw.rate_limit_window,
                WindowMode::Fixed,
                WindowMode::parse,
            )?,
            selection_mode: parse_enum(
                "SELECTION_MODE",
                raw.selection_mode,
                SelectionMode::Quota,
                SelectionMode::parse,
            )?,
            admission_timeout_secs: parse_number(
                "ADMISSION_TIMEOUT_SECS",
                text(raw.admission_timeout_secs),
                DEFAULT_ADMISSION_TIMEOUT_SECS,
            )?,
            admission_queue_capacity: parse_number(
                "ADMISSION_QUEUE_CAPACITY",
                text(raw.admission_queue_capacity),
                DEFAULT_ADMISSION_QUEUE_CAPACITY,
            )?
            .max(1),
            proxy_api_key: raw.proxy_api_key.unwrap_or_default(),
            allow_gemini_keys_for_auth: parse_bool(
                "ALLOW_GEMINI_KEYS_FOR_AUTH",
                text(raw.allow_gemini_keys_for_auth),
                true,
            )?,
        };

        if cfg.gemini_api_keys.is_empty() {
            return Err(AppError::PoolExhausted);
        }
        Ok(cfg)
    }

    /// Valkey 连接串：redis://[:password@]host:port/db
    pub fn valkey_url(&self) -> String {
        let password = self.valkey_password.trim();
        if password.is_empty() {
            format!(
                "redis://{}:{}/{}",
                self.valkey_host, self.valkey_port, self.valkey_db
            )
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.valkey_host,
                self.valkey_port,
                self.valkey_db
            )
        }
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        if self.admission_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.admission_timeout_secs))
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.log_level)
    }
}

/// 逗号分隔的 key 列表：去空白、去空项、去重（保留首次出现的顺序）。
fn parse_key_list(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for part in value.split(',') {
        let k = part.trim();
        if k.is_empty() || out.iter().any(|existing| existing == k) {
            continue;
        }
        out.push(k.to_string());
    }
    out
}

fn parse_number<T: std::str::FromStr>(
    name: &str,
    value: Option<String>,
    default: T,
) -> Result<T, AppError> {
    let Some(v) = value else {
        return Ok(default);
    };
    let v = v.trim();
    if v.is_empty() {
        return Ok(default);
    }
    v.parse::<T>()
        .map_err(|_| AppError::config(format!("{name} 不是合法的数字: {v}")))
}

fn parse_bool(name: &str, value: Option<String>, default: bool) -> Result<bool, AppError> {
    let Some(v) = value else {
        return Ok(default);
    };
    match v.trim().to_lowercase().as_str() {
        "" => Ok(default),
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        other => Err(AppError::config(format!("{name} 不是合法的布尔值: {other}"))),
    }
}

fn parse_enum<T>(
    name: &str,
    value: Option<String>,
    default: T,
    parse: fn(&str) -> Option<T>,
) -> Result<T, AppError> {
    let Some(v) = value else {
        return Ok(default);
    };
    if v.trim().is_empty() {
        return Ok(default);
    }
    parse(&v).ok_or_else(|| AppError::config(format!("{name} 取值无效: {}", v.trim())))
}

/// 加载 .env。已存在的进程环境变量优先。
fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：set_var 为 unsafe。这里只在启动阶段调用，且没有并发读写环境变量。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 不越过仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
impl Config {
    /// 测试用配置：内存存储、1 rpm、5 秒准入超时。
    pub fn for_tests(keys: &[&str]) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            gemini_api_keys: keys.iter().map(|k| k.to_string()).collect(),
            gemini_api_url: DEFAULT_GEMINI_API_URL.to_string(),
            proxy: String::new(),
            upstream_timeout_ms: 5_000,
            quota_store: QuotaStoreBackend::Memory,
            valkey_host: DEFAULT_VALKEY_HOST.to_string(),
            valkey_port: DEFAULT_VALKEY_PORT,
            valkey_password: String::new(),
            valkey_db: 0,
            rate_limit_per_minute: 1,
            rate_limit_per_day: 100,
            rate_limit_window: WindowMode::Sliding,
            selection_mode: SelectionMode::Quota,
            admission_timeout_secs: 5,
            admission_queue_capacity: 16,
            proxy_api_key: "proxy-secret".to_string(),
            allow_gemini_keys_for_auth: false,
        }
    }
}
