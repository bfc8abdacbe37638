//! Publisher - 批次投递
//!
//! 一次只发送一个批次，收到确认后才把批次交给 Registrar。
//! 任何错误都丢弃当前连接，轮转到下一个服务器后用同一个 sequence 重发，
//! 直到成功：至少一次投递，采集端可能看到重复批次。

use tokio::sync::mpsc;

use crate::client::{CollectorConnection, Connector};

use super::spooler::Batch;

/// Publisher
pub struct Publisher {
    connector: Connector,
    sequence: u64,
}

impl Publisher {
    pub fn new(connector: Connector) -> Self {
        Self {
            connector,
            sequence: 0,
        }
    }

    /// 运行直到批次通道关闭
    ///
    /// 已收到的批次总会投递完才返回。
    pub async fn run(mut self, mut batches: mpsc::Receiver<Batch>, acks: mpsc::Sender<Batch>) {
        let mut connection: Option<CollectorConnection> = None;

        while let Some(batch) = batches.recv().await {
            self.sequence += 1;
            self.deliver(&mut connection, &batch).await;

            tracing::debug!(
                "Batch {} acknowledged ({} events)",
                self.sequence,
                batch.len()
            );
            if acks.send(batch).await.is_err() {
                tracing::warn!("Registrar channel closed, acknowledged batch not recorded");
            }
        }

        tracing::info!("Publisher stopped after {} batches", self.sequence);
    }

    async fn deliver(&mut self, connection: &mut Option<CollectorConnection>, batch: &Batch) {
        let round_trip = self.connector.timeout();
        loop {
            if connection.is_none() {
                *connection = Some(self.connector.connect().await);
            }
            let Some(conn) = connection.as_mut() else {
                continue;
            };

            match conn.publish(self.sequence, batch, round_trip).await {
                Ok(()) => {
                    self.connector.reset_backoff();
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Publish of batch {} to {} failed: {}",
                        self.sequence,
                        conn.server(),
                        e
                    );
                    *connection = None;
                    self.connector.fail_over().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::protocol::{read_frame, write_frame, Response};
    use crate::types::DataEvent;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    fn event(line: u64) -> DataEvent {
        DataEvent {
            source: Arc::from("/tmp/app.log"),
            offset: line * 2,
            line,
            text: "x".to_string(),
            fields: Default::default(),
            identity: None,
        }
    }

    #[tokio::test]
    async fn test_sequences_increase_and_batches_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut seen = Vec::new();
            while let Some(value) = read_frame::<_, serde_json::Value>(&mut reader).await.unwrap() {
                let sequence = value["sequence"].as_u64().unwrap();
                seen.push(sequence);
                write_frame(&mut writer, &Response::Ack { sequence }).await.unwrap();
            }
            seen
        });

        let connector = Connector::new(ClientConfig {
            servers: vec![addr],
            timeout: Duration::from_secs(2),
            ..Default::default()
        });

        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (ack_tx, mut ack_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Publisher::new(connector).run(batch_rx, ack_tx));

        batch_tx.send(vec![event(1), event(2)]).await.unwrap();
        assert_eq!(ack_rx.recv().await.unwrap().len(), 2);
        batch_tx.send(vec![event(3)]).await.unwrap();
        assert_eq!(ack_rx.recv().await.unwrap()[0].line, 3);

        drop(batch_tx);
        handle.await.unwrap();
        assert_eq!(server.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resend_same_sequence_after_lost_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let mut seen = Vec::new();

            // 第一个连接：读到请求后直接断开，不回确认
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let value = read_frame::<_, serde_json::Value>(&mut reader).await.unwrap().unwrap();
            seen.push(value["sequence"].as_u64().unwrap());
            drop(reader);

            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let value = read_frame::<_, serde_json::Value>(&mut reader).await.unwrap().unwrap();
            let sequence = value["sequence"].as_u64().unwrap();
            seen.push(sequence);
            write_frame(&mut writer, &Response::Ack { sequence }).await.unwrap();
            seen
        });

        let connector = Connector::new(ClientConfig {
            servers: vec![addr],
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50));

        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (ack_tx, mut ack_rx) = mpsc::channel(1);
        tokio::spawn(Publisher::new(connector).run(batch_rx, ack_tx));

        batch_tx.send(vec![event(1)]).await.unwrap();
        let acked = ack_rx.recv().await.unwrap();
        assert_eq!(acked[0].line, 1);
        assert_eq!(server.await.unwrap(), vec![1, 1]);
    }
}
