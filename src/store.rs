// Recoup - 配置文件存储模块
// 负责管理用户保存的集群配置（Profile）的加载和保存

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// 集群配置文件（Profile）
///
/// 描述一个受备份的集群：数据目录、备份目录、归档目录和连接
/// 参数，保存在全局配置文件中，按名称引用。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Profile {
    /// 集群数据目录（$PGDATA）
    pub pgdata: PathBuf,

    /// 备份目录根
    pub backup_path: PathBuf,

    /// WAL 归档目录
    pub arclog_path: PathBuf,

    /// 服务器连接字符串（可选）
    #[serde(default)]
    pub conninfo: Option<String>,

    /// 是否使用平滑检查点
    #[serde(default)]
    pub smooth_checkpoint: bool,

    /// 保留的全量备份代数
    #[serde(default)]
    pub keep_generations: Option<usize>,

    /// 保留天数
    #[serde(default)]
    pub keep_days: Option<i64>,

    /// 排除模式列表（Glob 风格）
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// 应用程序全局配置
///
/// 包含所有用户定义的集群配置文件，存储在系统标准配置目录中。
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 配置文件集合，键为配置文件名称
    pub profiles: HashMap<String, Profile>,
}

impl AppConfig {
    /// 从配置文件加载应用配置
    ///
    /// # 返回
    /// * `Ok(AppConfig)` - 加载的配置，如果文件不存在则返回空配置
    /// * `Err(anyhow::Error)` - 如果配置文件存在但解析失败
    pub fn load() -> Result<Self> {
        let path = Self::get_config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// 保存配置到文件
    ///
    /// 如果配置目录不存在，会自动创建。
    pub fn save(&self) -> Result<()> {
        let path = Self::get_config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).context("Failed to write config file")
    }

    /// 获取配置文件的路径
    ///
    /// 使用 `directories` crate 获取平台标准的配置目录：
    /// - Linux: `~/.config/recoup/config.toml`
    /// - macOS: `~/Library/Application Support/recoup/config.toml`
    fn get_config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "recoup").context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
