//! Collector 连接逻辑
//!
//! 维护当前服务器，连接失败或中途出错时轮转到下一个服务器，
//! 以指数退避（有上限）无限重试：已读到的日志不能丢。

use std::borrow::Cow;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::types::DataEvent;

/// 可作为采集端连接的字节流（TCP 或 TLS）
pub trait CollectorStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> CollectorStream for T {}

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 采集端列表（host:port）
    pub servers: Vec<String>,
    /// 连接 / 单次往返超时
    pub timeout: Duration,
    /// 首次重试间隔
    pub backoff_initial: Duration,
    /// 重试间隔上限
    pub backoff_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout: Duration::from_secs(15),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// 从网络配置创建
    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            servers: network.servers.clone(),
            timeout: network.timeout(),
            ..Default::default()
        }
    }
}

/// 到某个采集端的连接
///
/// 由 Publisher 独占，同一时刻只有一个请求在途。
pub struct CollectorConnection {
    server: String,
    reader: BufReader<ReadHalf<Box<dyn CollectorStream>>>,
    writer: WriteHalf<Box<dyn CollectorStream>>,
}

impl CollectorConnection {
    pub fn new(server: impl Into<String>, stream: Box<dyn CollectorStream>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            server: server.into(),
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// 当前服务器地址
    pub fn server(&self) -> &str {
        &self.server
    }

    /// 发送一个批次并等待对应 sequence 的确认
    ///
    /// 写入和等待确认共享同一个截止时间。
    /// 早于本次 sequence 的确认（重连前遗留）被跳过。
    pub async fn publish(
        &mut self,
        sequence: u64,
        events: &[DataEvent],
        round_trip: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + round_trip;
        let request = Request::Publish {
            sequence,
            events: Cow::Borrowed(events),
        };

        timeout_at(deadline, write_frame(&mut self.writer, &request))
            .await
            .map_err(|_| {
                Error::Connection(format!("write to {} timed out (sequence={})", self.server, sequence))
            })??;

        loop {
            let frame: Option<Response> = timeout_at(deadline, read_frame(&mut self.reader))
                .await
                .map_err(|_| {
                    Error::Connection(format!(
                        "no ack from {} within {:?} (sequence={})",
                        self.server, round_trip, sequence
                    ))
                })??;

            match frame {
                None => {
                    return Err(Error::Connection(format!(
                        "{} closed the connection before ack (sequence={})",
                        self.server, sequence
                    )))
                }
                Some(Response::Ack { sequence: acked }) if acked == sequence => return Ok(()),
                Some(Response::Ack { sequence: acked }) if acked < sequence => {
                    tracing::debug!("Skipping stale ack {} from {} (waiting for {})", acked, self.server, sequence);
                }
                Some(Response::Ack { sequence: acked }) => {
                    return Err(Error::Protocol(format!(
                        "{} acked unknown sequence {} (sent {})",
                        self.server, acked, sequence
                    )))
                }
                Some(Response::Error { code, message }) => {
                    return Err(Error::Protocol(format!(
                        "{} rejected sequence {}: {} (code={})",
                        self.server, sequence, message, code
                    )))
                }
            }
        }
    }
}

/// 连接器：服务器轮转 + 退避
pub struct Connector {
    config: ClientConfig,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsConnector>,
    /// 当前服务器下标
    current: usize,
    /// 下一次失败后的等待时间
    backoff: Duration,
}

impl Connector {
    /// 明文连接器
    pub fn new(config: ClientConfig) -> Self {
        let backoff = config.backoff_initial;
        Self {
            config,
            #[cfg(feature = "tls")]
            tls: None,
            current: 0,
            backoff,
        }
    }

    /// 从网络配置创建；配置了 TLS 材料时启用加密
    pub fn from_config(network: &NetworkConfig) -> Result<Self> {
        if network.servers.is_empty() {
            return Err(Error::Config("no servers defined in network config".into()));
        }

        #[allow(unused_mut)]
        let mut connector = Self::new(ClientConfig::from_network(network));

        if network.tls_enabled() {
            #[cfg(feature = "tls")]
            {
                connector.tls = Some(super::tls::connector(network)?);
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(Error::Config(
                    "TLS material configured but built without the `tls` feature".into(),
                ));
            }
        } else {
            tracing::warn!("No TLS material configured, using an unencrypted connection");
        }

        Ok(connector)
    }

    /// 覆盖退避参数
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.backoff_initial = initial;
        self.config.backoff_max = max;
        self.backoff = initial;
        self
    }

    /// 单次往返超时
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// 当前服务器
    pub fn current_server(&self) -> &str {
        self.config
            .servers
            .get(self.current)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// 尝试连接当前服务器（一次）
    pub async fn try_connect(&self) -> Result<CollectorConnection> {
        let server = self.current_server().to_string();
        if server.is_empty() {
            return Err(Error::Config("no servers defined in network config".into()));
        }

        let tcp = timeout(self.config.timeout, TcpStream::connect(&server))
            .await
            .map_err(|_| Error::Connection(format!("connect to {} timed out", server)))?
            .map_err(|e| Error::Connection(format!("connect to {} failed: {}", server, e)))?;
        tcp.set_nodelay(true)?;

        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            let name = super::tls::server_name(&server)?;
            let stream = timeout(self.config.timeout, tls.connect(name, tcp))
                .await
                .map_err(|_| Error::Connection(format!("TLS handshake with {} timed out", server)))?
                .map_err(|e| Error::Connection(format!("TLS handshake with {} failed: {}", server, e)))?;
            return Ok(CollectorConnection::new(server, Box::new(stream)));
        }

        Ok(CollectorConnection::new(server, Box::new(tcp)))
    }

    /// 连接，直到成功为止
    pub async fn connect(&mut self) -> CollectorConnection {
        loop {
            match self.try_connect().await {
                Ok(conn) => {
                    tracing::info!("Connected to {}", conn.server());
                    return conn;
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {}: {}", self.current_server(), e);
                    self.fail_over().await;
                }
            }
        }
    }

    /// 轮转到下一个服务器并等待退避时间
    pub async fn fail_over(&mut self) {
        self.current = (self.current + 1) % self.config.servers.len().max(1);
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.backoff_max);
        tracing::debug!("Next server {} in {:?}", self.current_server(), delay);
        sleep(delay).await;
    }

    /// 成功确认后重置退避
    pub fn reset_backoff(&mut self) {
        self.backoff = self.config.backoff_initial;
    }
}
