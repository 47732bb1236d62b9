// Recoup - 备份配置管理模块
// 定义单次备份运行的全部参数，并做前置校验

use crate::catalog::BackupMode;
use crate::error::{BackupError, Result};
use crate::store::Profile;
use glob::Pattern;
use path_clean::PathClean;
use std::path::PathBuf;

/// 备份运行配置
///
/// 单次备份尝试的所有参数：集群数据目录、备份目录根、WAL 归档
/// 目录、备份模式、检查点策略、保留策略和排除模式。
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// 集群数据目录（$PGDATA）
    pub pgdata: PathBuf,

    /// 备份目录根（catalog 所在位置）
    pub backup_path: PathBuf,

    /// WAL 归档目录（差异模式下的扫描来源）
    pub arclog_path: PathBuf,

    /// 备份模式
    pub mode: BackupMode,

    /// 服务器连接字符串（为空则用环境默认值）
    pub conninfo: Option<String>,

    /// 平滑检查点（true 时把检查点 I/O 摊开，false 立即强制）
    pub smooth_checkpoint: bool,

    /// 保留的完成全量备份代数
    pub keep_generations: Option<usize>,

    /// 保留天数
    pub keep_days: Option<i64>,

    /// 用户附加的排除模式（Glob 风格）
    pub exclude_patterns: Vec<String>,

    /// 试运行模式（不写任何东西）
    pub dry_run: bool,

    /// 逐文件打印进度
    pub verbose: bool,
}

impl BackupConfig {
    /// 校验并归一化配置
    ///
    /// 数据目录和备份目录是必需参数；路径统一规整为干净形式。
    pub fn validate(mut self) -> Result<Self> {
        if self.pgdata.as_os_str().is_empty() {
            return Err(BackupError::Configuration(
                "PGDATA (-D, --pgdata)".into(),
            ));
        }
        if self.backup_path.as_os_str().is_empty() {
            return Err(BackupError::Configuration(
                "BACKUP_PATH (-B, --backup-path)".into(),
            ));
        }
        if self.arclog_path.as_os_str().is_empty() {
            return Err(BackupError::Configuration(
                "ARCLOG_PATH (-A, --arclog-path)".into(),
            ));
        }

        self.pgdata = self.pgdata.clean();
        self.backup_path = self.backup_path.clean();
        self.arclog_path = self.arclog_path.clean();
        Ok(self)
    }

    /// 从保存的配置文件（Profile）构建运行配置
    pub fn from_profile(
        profile: &Profile,
        mode: BackupMode,
        dry_run: bool,
        verbose: bool,
    ) -> Result<Self> {
        Self {
            pgdata: profile.pgdata.clone(),
            backup_path: profile.backup_path.clone(),
            arclog_path: profile.arclog_path.clone(),
            mode,
            conninfo: profile.conninfo.clone(),
            smooth_checkpoint: profile.smooth_checkpoint,
            keep_generations: profile.keep_generations,
            keep_days: profile.keep_days,
            exclude_patterns: profile.exclude.clone(),
            dry_run,
            verbose,
        }
        .validate()
    }

    /// 编译用户排除模式（非法模式打印警告后忽略）
    pub fn compiled_patterns(&self) -> Vec<Pattern> {
        self.exclude_patterns
            .iter()
            .filter_map(|s| match Pattern::new(s) {
                Ok(p) => Some(p),
                Err(e) => {
                    eprintln!("Warning: Invalid glob pattern '{}': {}", s, e);
                    None
                }
            })
            .collect()
    }
}
