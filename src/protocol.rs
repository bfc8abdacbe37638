//! 采集端协议定义
//!
//! 通信方式：TCP（可选 TLS）+ JSONL（每个帧一行 JSON + '\n'）
//!
//! - 请求：`{"type":"Publish","sequence":N,"events":[...]}`
//! - 响应：`{"type":"Ack","sequence":N}`
//!
//! 同一会话内 sequence 单调递增；重连后重发同一批次时沿用原 sequence。

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::types::DataEvent;

/// 单帧长度上限（防止对端发送无换行的垃圾数据撑爆内存）
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// 请求类型（Agent → Collector）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request<'a> {
    /// 发送一个批次
    Publish {
        sequence: u64,
        events: Cow<'a, [DataEvent]>,
    },
}

/// 响应类型（Collector → Agent）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 确认：该 sequence 及之前的数据已持久化
    Ack { sequence: u64 },

    /// 错误（批次未被接受，需要重发）
    Error { code: i32, message: String },
}

/// 写入一帧
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一帧，连接关闭返回 `None`
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    read_frame_limited(reader, MAX_FRAME_LEN).await
}

/// 读取一帧，最多缓冲 `max_len` 字节（含换行符）
///
/// 超过上限立即报错，不再继续读取该行的剩余部分。
pub async fn read_frame_limited<R, T>(reader: &mut R, max_len: usize) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > max_len {
        return Err(Error::Protocol(format!(
            "frame exceeds {} bytes",
            max_len
        )));
    }
    if line.last() != Some(&b'\n') {
        return Err(Error::Protocol("connection closed mid-frame".into()));
    }

    serde_json::from_slice(&line[..line.len() - 1])
        .map(Some)
        .map_err(|e| Error::Protocol(format!("invalid frame: {}", e)))
}
