//! 数据类型定义

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use file_id::FileId;
use serde::{Deserialize, Serialize};

/// 静态字段标签（来自配置，所有事件共享同一份）
pub type Fields = Arc<BTreeMap<String, String>>;

/// 持久化状态表：路径 → 文件状态
///
/// BTreeMap 保证序列化顺序稳定，重复保存得到相同字节。
pub type StateTable = BTreeMap<String, FileState>;

/// 与路径无关的文件标识
///
/// Unix 上是 (device, inode)，Windows 上是 (volume serial, file index)。
/// 同一路径的标识变化意味着文件被轮转或替换，而不是继续增长。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub device: u64,
    pub index: u128,
}

impl FileIdentity {
    /// 读取路径当前指向的文件标识
    pub fn of(path: impl AsRef<Path>) -> io::Result<Self> {
        file_id::get_file_id(path).map(Self::from)
    }
}

impl From<FileId> for FileIdentity {
    fn from(id: FileId) -> Self {
        match id {
            FileId::Inode {
                device_id,
                inode_number,
            } => Self {
                device: device_id,
                index: inode_number as u128,
            },
            FileId::LowRes {
                volume_serial_number,
                file_index,
            } => Self {
                device: volume_serial_number as u64,
                index: file_index as u128,
            },
            FileId::HighRes {
                volume_serial_number,
                file_id,
            } => Self {
                device: volume_serial_number,
                index: file_id,
            },
        }
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.device, self.index)
    }
}

/// 文件读取状态
///
/// 持久化格式为 `{"offset": .., "line": .., "identity": {..}}`，
/// 路径作为外层 map 的 key，不重复写入。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// 文件路径（map key，反序列化后回填）
    #[serde(skip)]
    pub source: String,
    /// 已消费字节数
    pub offset: u64,
    /// 已发出的行数
    pub line: u64,
    /// 文件标识（旧格式状态文件没有此字段）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<FileIdentity>,
    /// 最后一次看到该文件的时间（仅内存）
    #[serde(skip, default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl FileState {
    pub fn new(source: impl Into<String>, identity: Option<FileIdentity>) -> Self {
        Self {
            source: source.into(),
            offset: 0,
            line: 0,
            identity,
            last_seen: Utc::now(),
        }
    }

    /// 指定断点的状态
    pub fn at(mut self, offset: u64, line: u64) -> Self {
        self.offset = offset;
        self.line = line;
        self
    }
}

/// 行事件
///
/// 构造后不可变，按值在流水线中传递。
/// 线上格式：`{source, offset, line, text, fields}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// 来源路径
    pub source: Arc<str>,
    /// 本行之后的累计偏移
    pub offset: u64,
    /// 行号（从 1 开始）
    pub line: u64,
    /// 行内容（不含换行符）
    pub text: String,
    /// 静态字段标签
    #[serde(default, skip_serializing_if = "no_fields")]
    pub fields: Fields,
    /// 来源文件标识（不上线，仅供 Registrar 判断轮转）
    #[serde(skip)]
    pub identity: Option<FileIdentity>,
}

fn no_fields(fields: &Fields) -> bool {
    fields.is_empty()
}

/// Prospector 启动报告
///
/// 每个 Prospector 首轮扫描后为发现的每个文件发送一条 `State`，
/// 最后发送一条 `Done`，编排方据此倒数初始化完成的 Prospector。
#[derive(Debug, Clone)]
pub enum StartupReport {
    State(FileState),
    Done,
}
