//! 配置
//!
//! 配置文件为 JSON（允许 `#` 开头的注释行），可以是单个文件或目录。
//! 多个文件按顺序合并：列表追加，标量只允许被设置一次。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 单个配置文件大小上限
const CONFIG_FILE_SIZE_LIMIT: u64 = 10 << 20;

/// 默认网络超时（秒）
const DEFAULT_NET_TIMEOUT_SECS: u64 = 15;

/// 默认 dead time
const DEFAULT_DEAD_TIME: &str = "24h";

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub files: Vec<FileConfig>,
}

/// 网络配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 采集端地址列表（host:port），按顺序轮转
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(rename = "ssl certificate", default, skip_serializing_if = "Option::is_none")]
    pub ssl_certificate: Option<PathBuf>,
    #[serde(rename = "ssl key", default, skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<PathBuf>,
    #[serde(rename = "ssl ca", default, skip_serializing_if = "Option::is_none")]
    pub ssl_ca: Option<PathBuf>,
    /// 单次往返超时（秒），0 表示未设置
    #[serde(default)]
    pub timeout: u64,
}

impl NetworkConfig {
    /// 单次请求/确认往返超时
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// 是否启用加密传输
    pub fn tls_enabled(&self) -> bool {
        self.ssl_ca.is_some() || self.ssl_certificate.is_some() || self.ssl_key.is_some()
    }
}

/// 文件组配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// 路径或 glob 模式
    #[serde(default)]
    pub paths: Vec<String>,
    /// 附加到每个事件的静态字段
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// 文件不再被匹配多久之后停止跟踪
    #[serde(rename = "dead time", default)]
    pub dead_time: String,
    #[serde(skip)]
    dead_time_parsed: Option<Duration>,
}

impl FileConfig {
    pub fn new(paths: Vec<String>) -> Self {
        Self {
            paths,
            ..Default::default()
        }
    }

    /// 解析后的 dead time（finalize 之前返回默认值）
    pub fn dead_time(&self) -> Duration {
        self.dead_time_parsed
            .unwrap_or_else(|| Duration::from_secs(24 * 60 * 60))
    }

    /// 直接设置 dead time
    pub fn with_dead_time(mut self, dead_time: Duration) -> Self {
        self.dead_time = format!("{}ms", dead_time.as_millis());
        self.dead_time_parsed = Some(dead_time);
        self
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = fields;
        self
    }
}

impl Config {
    /// 合并另一份配置
    ///
    /// 列表追加；SSL 路径和超时只允许一份文件设置，重复设置报错。
    pub fn merge(&mut self, from: Config) -> Result<()> {
        self.network.servers.extend(from.network.servers);
        self.files.extend(from.files);

        merge_once(
            &mut self.network.ssl_certificate,
            from.network.ssl_certificate,
            "ssl certificate",
        )?;
        merge_once(&mut self.network.ssl_key, from.network.ssl_key, "ssl key")?;
        merge_once(&mut self.network.ssl_ca, from.network.ssl_ca, "ssl ca")?;

        if from.network.timeout != 0 {
            if self.network.timeout != 0 {
                return Err(Error::Config(format!(
                    "timeout already defined as '{}' in previous config file",
                    self.network.timeout
                )));
            }
            self.network.timeout = from.network.timeout;
        }
        Ok(())
    }

    /// 补全默认值并解析 dead time
    pub fn finalize(&mut self) -> Result<()> {
        if self.network.timeout == 0 {
            self.network.timeout = DEFAULT_NET_TIMEOUT_SECS;
        }

        for file in &mut self.files {
            if file.dead_time.is_empty() {
                file.dead_time = DEFAULT_DEAD_TIME.to_string();
            }
            let parsed = parse_duration(&file.dead_time).map_err(|e| {
                Error::Config(format!(
                    "failed to parse dead time '{}': {}",
                    file.dead_time, e
                ))
            })?;
            file.dead_time_parsed = Some(parsed);
        }
        Ok(())
    }

    /// 检查必填项
    pub fn validate(&self) -> Result<()> {
        if self.network.servers.is_empty() {
            return Err(Error::Config("no servers defined in network config".into()));
        }
        if self.files.is_empty() || self.files.iter().all(|f| f.paths.is_empty()) {
            return Err(Error::Config("no file paths defined".into()));
        }

        let net = &self.network;
        if net.ssl_certificate.is_some() != net.ssl_key.is_some() {
            return Err(Error::Config(
                "'ssl certificate' and 'ssl key' must be given together".into(),
            ));
        }
        if net.ssl_certificate.is_some() && net.ssl_ca.is_none() {
            return Err(Error::Config(
                "'ssl ca' is required when a client certificate is configured".into(),
            ));
        }
        if net.tls_enabled() && !cfg!(feature = "tls") {
            return Err(Error::Config(
                "TLS material configured but built without the `tls` feature".into(),
            ));
        }
        Ok(())
    }
}

fn merge_once(to: &mut Option<PathBuf>, from: Option<PathBuf>, name: &str) -> Result<()> {
    if let Some(value) = from {
        if let Some(existing) = to {
            return Err(Error::Config(format!(
                "{} already defined as '{}' in previous config file",
                name,
                existing.display()
            )));
        }
        *to = Some(value);
    }
    Ok(())
}

/// 列出配置文件：文件本身，或目录下的全部条目（按名称排序）
pub fn discover(file_or_directory: &Path) -> Result<Vec<PathBuf>> {
    let meta = fs::metadata(file_or_directory)?;
    if !meta.is_dir() {
        return Ok(vec![file_or_directory.to_path_buf()]);
    }

    let mut files = fs::read_dir(file_or_directory)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    files.sort();
    Ok(files)
}

/// 读取单个配置文件
///
/// 空文件返回 `None`；超过大小上限视为配置错误。
pub fn load_file(path: &Path) -> Result<Option<Config>> {
    let size = fs::metadata(path)?.len();
    if size > CONFIG_FILE_SIZE_LIMIT {
        return Err(Error::Config(format!(
            "config file {:?} size ({}) exceeds limit ({})",
            path, size, CONFIG_FILE_SIZE_LIMIT
        )));
    }
    if size == 0 {
        tracing::info!("config file {:?} is empty, skipping", path);
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    let stripped = strip_comments(&raw);
    let config = serde_json::from_str(&stripped)
        .map_err(|e| Error::Config(format!("failed to parse {:?}: {}", path, e)))?;
    Ok(Some(config))
}

/// 加载、合并、补全并校验配置
pub fn load(file_or_directory: &Path) -> Result<Config> {
    let files = discover(file_or_directory).map_err(|e| {
        Error::Config(format!("could not use config {:?}: {}", file_or_directory, e))
    })?;

    let mut config = Config::default();
    for file in files {
        tracing::debug!("Loading config file {:?}", file);
        let loaded = load_file(&file).map_err(|e| match e {
            Error::Config(_) => e,
            other => Error::Config(format!("could not load config file {:?}: {}", file, other)),
        })?;
        if let Some(additional) = loaded {
            config.merge(additional)?;
        }
    }

    config.finalize()?;
    config.validate()?;
    Ok(config)
}

/// 去掉 `#` 开头的注释行（允许前导空白）和 `\r`
pub fn strip_comments(data: &str) -> String {
    data.replace('\r', "")
        .split('\n')
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 解析 Go 风格时长：`300ms`、`10s`、`5m`、`24h`、`1h30m`
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    if raw == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", raw))?;
        if digits == 0 {
            return Err(format!("invalid duration '{}'", raw));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", raw))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, raw)),
        };
        rest = &rest[unit_len..];
        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
    }
    Ok(total)
}

/// 运行参数
///
/// 启动时构造一次，之后只读，按值传给各组件。
#[derive(Debug, Clone)]
pub struct Options {
    /// 配置文件或目录
    pub config_arg: PathBuf,
    /// 事件数达到该值时立即发送
    pub spool_size: usize,
    /// Harvester 读缓冲大小
    pub harvester_buffer_size: usize,
    /// 空闲多久强制发送
    pub idle_timeout: Duration,
    /// 截断后从头继续读同一文件
    pub tail_on_rotate: bool,
    /// 只输出警告和错误
    pub quiet: bool,
    /// 状态文件路径
    pub state_file: PathBuf,
    /// Prospector 扫描周期
    pub prospect_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_arg: PathBuf::new(),
            spool_size: 1024,
            harvester_buffer_size: 16 << 10,
            idle_timeout: Duration::from_secs(5),
            tail_on_rotate: false,
            quiet: false,
            state_file: PathBuf::from(".data-forwarder"),
            prospect_interval: Duration::from_secs(10),
        }
    }
}

impl Options {
    /// 输出生效的参数
    pub fn emit(&self) {
        tracing::info!("--- options -------");
        tracing::info!("config-arg:          {}", self.config_arg.display());
        tracing::info!("idle-timeout:        {:?}", self.idle_timeout);
        tracing::info!("spool-size:          {}", self.spool_size);
        tracing::info!("harvester-buff-size: {}", self.harvester_buffer_size);
        tracing::info!("state-file:          {}", self.state_file.display());
        tracing::info!("--- flags ---------");
        tracing::info!("tail (on-rotation):  {}", self.tail_on_rotate);
        tracing::info!("quiet:               {}", self.quiet);
    }
}
