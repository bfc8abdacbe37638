//! Collector Client 模块
//!
//! 连接采集端（TCP，可选 TLS），按服务器列表轮转并带退避重连

mod connect;

#[cfg(feature = "tls")]
pub mod tls;

pub use connect::{ClientConfig, CollectorConnection, CollectorStream, Connector};
