//! Sensor 注册表
//!
//! 辅助数据源（sensor）实现 [`Driver`]，以唯一名称注册到 [`Registry`]。
//! 注册表由启动入口持有并传给 Agent，不存在进程级全局表。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Sensor 驱动
pub trait Driver: Send + Sync {
    /// 从给定文件或目录加载配置
    fn load_config(&self, file_or_directory: &Path) -> anyhow::Result<()>;
}

/// 驱动注册表
#[derive(Default, Clone)]
pub struct Registry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册驱动
    ///
    /// 名称为空或重复注册返回错误。
    pub fn register(&mut self, name: &str, driver: Arc<dyn Driver>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Sensor("register called with an empty name".into()));
        }
        if self.drivers.contains_key(name) {
            return Err(Error::Sensor(format!("register called twice for driver {}", name)));
        }
        self.drivers.insert(name.to_string(), driver);
        Ok(())
    }

    /// 按名称查找，不存在时报错
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Sensor(format!("can not find {} in registered drivers", name)))
    }

    /// 已注册的名称（有序）
    pub fn names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// 依次让每个驱动加载配置
    ///
    /// 单个驱动失败只记录警告，返回失败的驱动名称。
    pub fn load_all(&self, file_or_directory: &Path) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, driver) in &self.drivers {
            match driver.load_config(file_or_directory) {
                Ok(()) => tracing::info!("Sensor {} loaded config from {:?}", name, file_or_directory),
                Err(e) => {
                    tracing::warn!("Sensor {} failed to load config {:?}: {:#}", name, file_or_directory, e);
                    failed.push(name.clone());
                }
            }
        }
        failed
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("drivers", &self.names()).finish()
    }
}
