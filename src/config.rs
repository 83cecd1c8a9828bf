use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_UPSTREAM_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_FREE_MODEL_SUFFIX: &str = ":free";
const DEFAULT_MODEL_REFRESH_INTERVAL_SECS: u64 = 3600;
const DEFAULT_MODEL_OWNER: &str = "openrouter";
const DB_FILE_NAME: &str = "or2api.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// 所有 /v1 与 /manager/api 路由共用的 Bearer 密钥。
    pub api_key: String,

    pub upstream_base_url: String,
    pub http_referer: String,
    pub x_title: String,
    pub timeout_ms: u64,
    pub proxy: String,

    pub free_model_suffix: String,
    pub model_refresh_interval_secs: u64,
    pub model_owner: String,

    pub data_dir: String,
    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "API_KEY")]
    api_key: Option<String>,

    #[serde(alias = "UPSTREAM_BASE_URL")]
    upstream_base_url: Option<String>,
    #[serde(alias = "HTTP_REFERER")]
    http_referer: Option<String>,
    #[serde(alias = "X_TITLE")]
    x_title: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "FREE_MODEL_SUFFIX")]
    free_model_suffix: Option<String>,
    #[serde(alias = "MODEL_REFRESH_INTERVAL")]
    model_refresh_interval: Option<u64>,
    #[serde(alias = "MODEL_OWNER")]
    model_owner: Option<String>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        let upstream_base_url = raw
            .upstream_base_url
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_key: raw.api_key.unwrap_or_default().trim().to_string(),
            upstream_base_url,
            http_referer: raw.http_referer.unwrap_or_default(),
            x_title: raw.x_title.unwrap_or_default(),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            free_model_suffix: raw
                .free_model_suffix
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FREE_MODEL_SUFFIX.to_string()),
            model_refresh_interval_secs: raw
                .model_refresh_interval
                .unwrap_or(DEFAULT_MODEL_REFRESH_INTERVAL_SECS),
            model_owner: raw
                .model_owner
                .unwrap_or_else(|| DEFAULT_MODEL_OWNER.to_string()),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(DB_FILE_NAME)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.upstream_base_url)
    }

    pub fn models_url(&self) -> String {
        format!("{}/models", self.upstream_base_url)
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}

/// 读取最近的 `.env`；进程里已有的同名变量优先。
fn load_dotenv() {
    let Some(path) = find_dotenv_path() else {
        return;
    };
    let Ok(content) = std::fs::read_to_string(&path) else {
        return;
    };

    for (key, value) in content.lines().filter_map(parse_dotenv_line) {
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // 仅在启动阶段、尚未创建其它线程时调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

/// 从当前目录向上查找 `.env`，到达项目根（含 Cargo.toml 或 .git）为止。
fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    for dir in cwd.ancestors() {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }
        if is_project_root(dir) {
            break;
        }
    }
    None
}

fn is_project_root(dir: &Path) -> bool {
    dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir()
}

/// 解析一行 `KEY=VALUE`：支持 `export` 前缀、成对引号与行尾 ` #` 注释。
fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let value = value.trim();
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    let value = if quoted {
        &value[1..value.len() - 1]
    } else {
        match value.find(" #").or_else(|| value.find("\t#")) {
            Some(idx) => value[..idx].trim_end(),
            None if value.starts_with('#') => "",
            None => value,
        }
    };

    Some((key.to_string(), value.to_string()))
}
