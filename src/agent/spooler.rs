//! Spooler - 事件攒批
//!
//! 按到达顺序累积事件，满足任一条件即发送一个批次：
//! - 累计数量达到 `spool_size`
//! - 距上次发送（或启动）已过 `idle_timeout`
//!
//! 批次通道容量为 1：Publisher 手里最多再压一个批次。

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::types::DataEvent;

/// 事件批次（保持到达顺序）
pub type Batch = Vec<DataEvent>;

/// Spooler
#[derive(Debug, Clone)]
pub struct Spooler {
    spool_size: usize,
    idle_timeout: Duration,
}

impl Spooler {
    pub fn new(spool_size: usize, idle_timeout: Duration) -> Self {
        Self {
            spool_size: spool_size.max(1),
            idle_timeout,
        }
    }

    /// 运行直到事件通道关闭
    ///
    /// 关闭时先把手里剩余的事件作为最后一个批次发出。
    pub async fn run(self, mut events: mpsc::Receiver<DataEvent>, batches: mpsc::Sender<Batch>) {
        let mut spool: Batch = Vec::with_capacity(self.spool_size);
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        spool.push(event);
                        if spool.len() >= self.spool_size {
                            if !self.flush(&mut spool, &batches, "spool full").await {
                                return;
                            }
                            deadline = Instant::now() + self.idle_timeout;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    if !spool.is_empty() && !self.flush(&mut spool, &batches, "idle timeout").await {
                        return;
                    }
                    deadline = Instant::now() + self.idle_timeout;
                }
            }
        }

        if !spool.is_empty() {
            self.flush(&mut spool, &batches, "shutdown").await;
        }
        tracing::info!("Spooler stopped");
    }

    async fn flush(&self, spool: &mut Batch, batches: &mpsc::Sender<Batch>, reason: &str) -> bool {
        let batch = std::mem::replace(spool, Vec::with_capacity(self.spool_size));
        tracing::debug!("Flushing {} events ({})", batch.len(), reason);
        if batches.send(batch).await.is_err() {
            tracing::warn!("Publisher channel closed, dropping spool");
            return false;
        }
        true
    }
}
