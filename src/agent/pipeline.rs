//! Agent - 组装五个阶段
//!
//! Prospector → Harvester → (events) → Spooler → (batches) → Publisher → (acks) → Registrar
//!
//! 启动顺序：
//! 1. 读取状态文件，启动所有 Prospector
//! 2. 等所有 Prospector 报告完首轮状态，用这些状态初始化 Registrar
//! 3. 启动 Spooler / Publisher / Registrar
//!
//! 停止信号到来后 Prospector 和 Harvester 退出，事件通道随之关闭，
//! 下游按顺序排空：Spooler 发出剩余事件，Publisher 投递完已收到的批次，
//! Registrar 最后落盘一次。

use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::prospector::Prospector;
use super::publisher::Publisher;
use super::spooler::Spooler;
use crate::client::Connector;
use crate::config::{Config, Options};
use crate::error::{Error, Result};
use crate::registrar::{load_state, Registrar};
use crate::sensor::Registry;
use crate::types::{StartupReport, StateTable};

/// Harvester → Spooler
const EVENT_CHANNEL_CAPACITY: usize = 16;
/// Spooler → Publisher：最多一个在途批次
const BATCH_CHANNEL_CAPACITY: usize = 1;
/// Publisher → Registrar
const ACK_CHANNEL_CAPACITY: usize = 1;

/// 转发 Agent
pub struct Agent {
    config: Config,
    options: Options,
    registry: Registry,
    backoff: Option<(Duration, Duration)>,
}

impl Agent {
    /// `config` 须已 finalize
    pub fn new(config: Config, options: Options, registry: Registry) -> Self {
        Self {
            config,
            options,
            registry,
            backoff: None,
        }
    }

    /// 覆盖重连退避参数
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = Some((initial, max));
        self
    }

    /// 运行直到停止信号到来且管道排空，返回最终状态表
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<StateTable> {
        let mut connector = Connector::from_config(&self.config.network)?;
        if let Some((initial, max)) = self.backoff {
            connector = connector.with_backoff(initial, max);
        }

        if !self.registry.is_empty() {
            let failed = self.registry.load_all(&self.options.config_arg);
            if !failed.is_empty() {
                tracing::warn!("{} sensors failed to load config: {:?}", failed.len(), failed);
            }
        }

        let resume = match load_state(&self.options.state_file) {
            Ok(table) => {
                tracing::info!(
                    "Loaded {} file states from {}",
                    table.len(),
                    self.options.state_file.display()
                );
                table
            }
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable state file {}: {}",
                    self.options.state_file.display(),
                    e
                );
                StateTable::new()
            }
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let (report_tx, mut report_rx) = mpsc::channel(64);

        let mut prospectors = Vec::with_capacity(self.config.files.len());
        for file_config in &self.config.files {
            let prospector = Prospector::new(file_config, resume.clone(), &self.options);
            prospectors.push(tokio::spawn(prospector.run(
                report_tx.clone(),
                event_tx.clone(),
                shutdown.clone(),
            )));
        }
        drop(report_tx);
        drop(event_tx);

        // 只保留本轮仍被发现的文件
        let mut pending = prospectors.len();
        tracing::info!("Waiting for {} prospectors to initialise", pending);
        let mut seeded = StateTable::new();
        while pending > 0 {
            match report_rx.recv().await {
                Some(StartupReport::State(state)) => {
                    tracing::debug!("Registrar will re-save state for {}", state.source);
                    seeded.insert(state.source.clone(), state);
                }
                Some(StartupReport::Done) => pending -= 1,
                None => break,
            }
        }
        tracing::info!("All prospectors initialised with {} states to persist", seeded.len());

        let registrar = tokio::spawn(Registrar::new(self.options.state_file.clone(), seeded).run(ack_rx));
        let spooler = tokio::spawn(
            Spooler::new(self.options.spool_size, self.options.idle_timeout).run(event_rx, batch_tx),
        );
        let publisher = tokio::spawn(Publisher::new(connector).run(batch_rx, ack_tx));

        for prospector in prospectors {
            join("prospector", prospector).await?;
        }
        join("spooler", spooler).await?;
        join("publisher", publisher).await?;
        let states = join("registrar", registrar).await?;

        tracing::info!("Agent stopped");
        Ok(states)
    }
}

async fn join<T>(stage: &str, handle: JoinHandle<T>) -> Result<T> {
    handle.await.map_err(|e| {
        tracing::error!("{} task failed: {}", stage, e);
        Error::Other(anyhow!("{} task failed: {}", stage, e))
    })
}
