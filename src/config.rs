use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::planner::DEFAULT_FAILURE_SIZE;

/// 索引配置（TOML）。缺省字段取默认值。
///
/// ```toml
/// root = "/var/lib/partidx/people"
/// failure_size = 16384
/// log_filter = "partidx=debug"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// 逻辑索引根目录
    pub root: PathBuf,
    /// 失败记录预留字节数
    pub failure_size: usize,
    /// tracing EnvFilter 语法，仅二进制使用
    pub log_filter: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            root: base.join("partidx").join("index"),
            failure_size: DEFAULT_FAILURE_SIZE,
            log_filter: "info".to_string(),
        }
    }
}

impl IndexConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}
