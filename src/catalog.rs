// Recoup - 备份目录（catalog）模块
// 负责备份描述符的持久化、备份列表维护、互斥锁和保留策略清理

use crate::error::{BackupError, Result};
use crate::filelist::BYTES_INVALID;
use crate::lsn::{Lsn, TimelineId};
use crate::pagemap::{BLCKSZ, XLOG_BLCKSZ};
use chrono::{DateTime, Duration, Local};
use console::style;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// 备份目录名（描述符之下的数据载荷目录）
pub const DATABASE_DIR: &str = "database";

/// 文件清单记录的文件名
pub const DATABASE_FILE_LIST: &str = "file_database.txt";

/// 描述符文件名
const BACKUP_INI: &str = "backup.ini";

/// 互斥锁文件名
const LOCK_FILE: &str = "backup.lock";

/// 备份目录中时间戳文件夹的命名格式
const FOLDER_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// 备份模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    /// 全量备份
    Full,
    /// 页级差异备份（只复制参照备份以来变更过的块）
    DifferentialPage,
}

/// 备份状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    Running,
    Done,
    Error,
}

/// 备份描述符
///
/// 每次备份尝试对应一个，创建时和每次状态转换时都会持久化，
/// 保证中途崩溃留下的是可发现的 `Error` 记录而不是沉默。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDescriptor {
    /// 备份模式
    pub mode: BackupMode,

    /// 当前状态
    pub status: BackupStatus,

    /// 备份所在时间线
    pub timeline: TimelineId,

    /// 起始 LSN（start-backup 的返回值）
    pub start_lsn: Lsn,

    /// 终止 LSN（stop-backup 的返回值）
    pub stop_lsn: Lsn,

    /// 唯一的开始时间（同时决定备份文件夹名）
    pub start_time: DateTime<Local>,

    /// 结束时间（成功或失败时设置；缺失表示仍在运行）
    pub end_time: Option<DateTime<Local>>,

    /// 累计数据字节数（全量为写入量、差异为读取量）
    pub data_bytes: i64,

    /// 恢复点事务 id（stop-backup 后的 txid_current()）
    pub recovery_xid: u32,

    /// 恢复点时刻
    pub recovery_time: Option<DateTime<Local>>,

    /// 声明的数据块大小
    pub block_size: u32,

    /// 声明的 WAL 块大小
    pub wal_block_size: u32,
}

impl BackupDescriptor {
    /// 创建一个新的 `Running` 描述符
    pub fn start(mode: BackupMode) -> Self {
        Self {
            mode,
            status: BackupStatus::Running,
            timeline: 0,
            start_lsn: Lsn::default(),
            stop_lsn: Lsn::default(),
            start_time: Local::now(),
            end_time: None,
            data_bytes: BYTES_INVALID,
            recovery_xid: 0,
            recovery_time: None,
            block_size: BLCKSZ,
            wal_block_size: XLOG_BLCKSZ,
        }
    }

    /// 该备份的文件夹名（由开始时间决定）
    pub fn folder_name(&self) -> String {
        self.start_time.format(FOLDER_TIME_FORMAT).to_string()
    }
}

/// 备份目录的互斥锁
///
/// 创建时独占生成锁文件，已存在则立即失败（不重试）。
/// Drop 时移除锁文件。
pub struct CatalogLock {
    path: PathBuf,
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// 备份目录
///
/// 根目录下每个时间戳文件夹代表一次备份，内含 `backup.ini`
/// 描述符、`file_database.txt` 文件清单和 `database/` 数据载荷。
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 获取备份目录的独占锁
    ///
    /// 锁文件已存在说明另一个实例正在运行：快速失败。
    pub fn lock(&self) -> Result<CatalogLock> {
        fs::create_dir_all(&self.root).map_err(|e| BackupError::io(&self.root, e))?;

        let path = self.root.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut fp) => {
                let _ = writeln!(fp, "{}", std::process::id());
                Ok(CatalogLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BackupError::ConcurrencyConflict)
            }
            Err(e) => Err(BackupError::io(&path, e)),
        }
    }

    /// 单个备份的根目录
    pub fn backup_dir(&self, desc: &BackupDescriptor) -> PathBuf {
        self.root.join(desc.folder_name())
    }

    /// 单个备份的数据载荷目录
    pub fn database_dir(&self, desc: &BackupDescriptor) -> PathBuf {
        self.backup_dir(desc).join(DATABASE_DIR)
    }

    /// 单个备份的文件清单路径
    pub fn file_list_path(&self, desc: &BackupDescriptor) -> PathBuf {
        self.backup_dir(desc).join(DATABASE_FILE_LIST)
    }

    /// 创建备份目录结构
    pub fn create_backup_dir(&self, desc: &BackupDescriptor) -> Result<()> {
        let dir = self.database_dir(desc);
        fs::create_dir_all(&dir).map_err(|e| BackupError::io(&dir, e))
    }

    /// 持久化描述符（创建时和每次状态转换时调用）
    pub fn write_descriptor(&self, desc: &BackupDescriptor) -> Result<()> {
        let dir = self.backup_dir(desc);
        fs::create_dir_all(&dir).map_err(|e| BackupError::io(&dir, e))?;

        let path = dir.join(BACKUP_INI);
        let content = toml::to_string_pretty(desc)
            .map_err(|e| BackupError::Catalog(format!("cannot serialize descriptor: {e}")))?;
        fs::write(&path, content).map_err(|e| BackupError::io(&path, e))
    }

    /// 读取全部既有备份，按开始时间升序
    ///
    /// 没有描述符或描述符损坏的目录直接跳过，不让一条坏记录
    /// 挡住新备份。
    pub fn backup_list(&self) -> Result<Vec<BackupDescriptor>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut list = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| BackupError::io(&self.root, e))?;
        for entry in entries.flatten() {
            let ini = entry.path().join(BACKUP_INI);
            if !ini.is_file() {
                continue;
            }
            let Ok(content) = fs::read_to_string(&ini) else {
                continue;
            };
            if let Ok(desc) = toml::from_str::<BackupDescriptor>(&content) {
                list.push(desc);
            }
        }

        list.sort_by_key(|d| d.start_time);
        Ok(list)
    }

    /// 找到指定时间线上最近一次完成的全量备份
    ///
    /// 差异备份的参照基准。找不到时差异备份无法进行。
    pub fn last_done_full_backup(
        list: &[BackupDescriptor],
        timeline: TimelineId,
    ) -> Option<&BackupDescriptor> {
        list.iter()
            .rev()
            .find(|d| d.mode == BackupMode::Full && d.status == BackupStatus::Done && d.timeline == timeline)
    }

    /// 应用保留策略，删除超出范围的旧备份
    ///
    /// 保留最近 `keep_generations` 个完成的全量备份（以及比最旧
    /// 保留全量更新的所有备份），同时保留 `keep_days` 天以内的
    /// 备份。两个参数都未指定时不做任何清理。
    ///
    /// # 返回
    /// 删除的备份数量
    pub fn apply_retention(
        &self,
        keep_generations: Option<usize>,
        keep_days: Option<i64>,
        dry_run: bool,
    ) -> Result<usize> {
        if keep_generations.is_none() && keep_days.is_none() {
            return Ok(0);
        }

        let list = self.backup_list()?;

        // 代数阈值：倒数第 keep_generations 个完成全量的开始时间
        let generation_threshold = keep_generations.and_then(|keep| {
            let fulls: Vec<_> = list
                .iter()
                .filter(|d| d.mode == BackupMode::Full && d.status == BackupStatus::Done)
                .collect();
            if fulls.len() > keep {
                fulls.get(fulls.len() - keep).map(|d| d.start_time)
            } else {
                None
            }
        });

        let day_threshold = keep_days.map(|days| Local::now() - Duration::days(days));

        let mut deleted = 0;
        for desc in &list {
            // 仍在运行的备份不碰
            if desc.status == BackupStatus::Running {
                continue;
            }

            let too_old_generation =
                generation_threshold.map(|t| desc.start_time < t).unwrap_or(true);
            let too_old_days = day_threshold.map(|t| desc.start_time < t).unwrap_or(true);
            if keep_generations.is_some() && !too_old_generation {
                continue;
            }
            if keep_days.is_some() && !too_old_days {
                continue;
            }
            // 只有同时超出所有启用的阈值才删除
            if keep_generations.is_some() && generation_threshold.is_none() {
                continue;
            }

            let dir = self.backup_dir(desc);
            if dry_run {
                println!(
                    "{} Would delete backup {:?}",
                    style("Dry run:").yellow(),
                    desc.folder_name()
                );
            } else {
                println!("Deleting old backup: {:?}", style(desc.folder_name()).red());
                fs::remove_dir_all(&dir).map_err(|e| BackupError::io(&dir, e))?;
            }
            deleted += 1;
        }

        Ok(deleted)
    }
}
