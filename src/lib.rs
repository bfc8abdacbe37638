//! data-forwarder - 日志转发 Agent
//!
//! 跟踪本地日志文件，逐行读取后批量发送到远端采集端，
//! 收到确认后才记录读取位置，重启后从断点继续。
//!
//! # 管道
//!
//! - **Prospector**: 展开 glob，按文件身份识别轮转/重命名，管理 Harvester
//! - **Harvester**: 每个文件一个，按行切分并发出事件
//! - **Spooler**: 按数量或空闲超时攒批
//! - **Publisher**: 通过 TCP（可选 TLS）发送批次，等待确认，失败轮转服务器重发
//! - **Registrar**: 记录已确认的位置，原子写入状态文件
//!
//! 投递语义为至少一次：连接在确认前断开时同一批次会被重发。
//!
//! # Feature Flags
//!
//! - `tls`（默认）: rustls 加密连接与客户端证书认证

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registrar;
pub mod sensor;
pub mod types;

// Re-exports
pub use agent::{Agent, Harvester, Prospector, Publisher, Spooler};
pub use client::{ClientConfig, Connector};
pub use config::{Config, FileConfig, NetworkConfig, Options};
pub use error::{Error, ExitStatus, Result};
pub use registrar::Registrar;
pub use types::*;

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
