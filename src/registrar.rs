//! Registrar - 读取位置的唯一写入者
//!
//! 持有内存中的状态表，消费已确认的批次并更新每个文件的 offset/line，
//! 每次更新后整体写入状态文件：先写同目录临时文件，再原子 rename 覆盖。
//! 读者永远看不到写了一半的状态文件。
//!
//! 路径被轮转到新文件后，旧文件最后确认的位置仍以 `<路径>#<标识>` 为 key 保留，
//! 旧文件被改名到其它匹配路径时，重启后可按标识找回位置。

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{DataEvent, FileIdentity, FileState, StateTable};

/// 每个路径保留的旧文件位置数
const RETIRED_PER_PATH: usize = 4;

/// 被轮转替换掉的文件在状态表中的 key
pub fn retired_key(source: &str, identity: &FileIdentity) -> String {
    format!("{}#{}", source, identity)
}

/// 读取状态文件
///
/// 文件不存在时返回空表。
pub fn load_state(path: &Path) -> Result<StateTable> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StateTable::new()),
        Err(e) => return Err(e.into()),
    };

    let mut table: StateTable = serde_json::from_slice(&data)?;
    for (source, state) in table.iter_mut() {
        state.source = source.clone();
    }
    Ok(table)
}

/// 原子写入状态文件
pub fn save_state(path: &Path, table: &StateTable) -> Result<()> {
    let data = serde_json::to_vec(table)?;
    write_atomic(path, &data)?;
    Ok(())
}

/// 写临时文件 → fsync → rename
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        tracing::warn!(
            "registry rotate: rename of {:?} to {:?} failed: {}",
            e.file.path(),
            path,
            e.error
        );
        e.error
    })?;
    Ok(())
}

/// Registrar
pub struct Registrar {
    /// 状态文件路径
    path: PathBuf,
    /// 当前状态表
    states: StateTable,
    /// 每个路径已被替换掉的旧文件标识，最早的在前
    superseded: HashMap<String, VecDeque<FileIdentity>>,
}

impl Registrar {
    /// 以启动快照初始化
    pub fn new(path: impl Into<PathBuf>, initial: StateTable) -> Self {
        Self {
            path: path.into(),
            states: initial,
            superseded: HashMap::new(),
        }
    }

    /// 当前状态表
    pub fn states(&self) -> &StateTable {
        &self.states
    }

    /// 应用一批已确认的事件
    ///
    /// 同一文件标识的事件按确认顺序到达，后到的即为更新的位置。
    /// 标识变化（轮转）时切换到新标识，旧标识随后到达的事件只更新它保留下来的位置。
    /// 返回应用的事件数。
    pub fn apply(&mut self, events: &[DataEvent]) -> usize {
        for event in events {
            let key = self.key_for(event.source.as_ref(), event.identity);
            let state = self
                .states
                .entry(key)
                .or_insert_with(|| FileState::new(event.source.as_ref(), event.identity));
            if state.identity.is_none() {
                state.identity = event.identity;
            }
            state.offset = event.offset;
            state.line = event.line;
            state.last_seen = Utc::now();
        }
        events.len()
    }

    /// 事件应记到哪个条目；路径换了文件时先把旧文件的位置挪走
    fn key_for(&mut self, source: &str, identity: Option<FileIdentity>) -> String {
        let current = self.states.get(source).and_then(|s| s.identity);
        let (Some(current), Some(incoming)) = (current, identity) else {
            return source.to_string();
        };
        if current == incoming {
            return source.to_string();
        }

        let retired = retired_key(source, &incoming);
        if self.states.contains_key(&retired) {
            tracing::trace!("Late ack for superseded file {} ({})", source, incoming);
            return retired;
        }

        tracing::debug!(
            "Registrar switching {} from {} to {}",
            source,
            current,
            incoming
        );
        self.retire(source, current);
        source.to_string()
    }

    fn retire(&mut self, source: &str, identity: FileIdentity) {
        let Some(mut old) = self.states.remove(source) else {
            return;
        };
        let key = retired_key(source, &identity);
        old.source = key.clone();
        self.states.insert(key, old);

        let generations = self.superseded.entry(source.to_string()).or_default();
        generations.push_back(identity);
        while generations.len() > RETIRED_PER_PATH {
            if let Some(oldest) = generations.pop_front() {
                self.states.remove(&retired_key(source, &oldest));
            }
        }
    }

    /// 写入状态文件
    ///
    /// 失败只记录日志，内存状态保留，下一次更新再试。
    pub async fn persist(&self) -> bool {
        let path = self.path.clone();
        let data = match serde_json::to_vec(&self.states) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("Failed to serialize registrar state: {}", e);
                return false;
            }
        };

        let result = tokio::task::spawn_blocking(move || write_atomic(&path, &data)).await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("Failed to write state file {:?}: {}", self.path, e);
                false
            }
            Err(e) => {
                tracing::error!("State writer task failed: {}", e);
                false
            }
        }
    }

    /// 运行：消费确认通道直到关闭
    ///
    /// 启动时先写一次初始快照，关闭前的最后一批确认同样会落盘。
    pub async fn run(mut self, mut acks: mpsc::Receiver<Vec<DataEvent>>) -> StateTable {
        self.persist().await;

        while let Some(events) = acks.recv().await {
            let updated = self.apply(&events);
            tracing::debug!("Registrar received {} events", updated);
            if updated > 0 {
                self.persist().await;
            }
        }

        tracing::info!("Registrar stopped, {} files recorded", self.states.len());
        self.states
    }
}
