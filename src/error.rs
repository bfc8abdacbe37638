//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误（缺失或冲突的必填项）
    #[error("配置错误: {0}")]
    Config(String),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),

    /// 协议错误（帧格式、序列号不匹配）
    #[error("协议错误: {0}")]
    Protocol(String),

    /// TLS 材料错误
    #[error("TLS 错误: {0}")]
    Tls(String),

    /// Sensor 注册表错误
    #[error("Sensor 错误: {0}")]
    Sensor(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否为配置类错误（进程以 usage-error 退出）
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Tls(_))
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;

/// 进程退出状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok = 0,
    /// 缺少必要配置
    UsageError = 1,
    /// 不可恢复的运行时错误
    Faulted = 2,
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status as u8)
    }
}
