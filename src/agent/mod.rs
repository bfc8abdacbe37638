//! Agent 模块 - 日志转发管道
//!
//! - Prospector：发现文件，管理 Harvester 生命周期
//! - Harvester：逐行读取单个文件
//! - Spooler：按数量或空闲时间攒批
//! - Publisher：投递批次并等待确认
//! - Registrar（见 `crate::registrar`）：记录已确认的位置

mod harvester;
mod pipeline;
mod prospector;
mod publisher;
mod spooler;

pub use harvester::{HarvestExit, HarvestReport, Harvester, HarvesterOptions};
pub use pipeline::Agent;
pub use prospector::Prospector;
pub use publisher::Publisher;
pub use spooler::{Batch, Spooler};
