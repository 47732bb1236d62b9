// Recoup - 备份编排模块
// 顶层状态机：串联归档协调、目录枚举、页级追踪和复制阶段，
// 保证服务器侧的备份括号在任何异常终止下都会被关闭

use crate::archive::ArchiveCoordinator;
use crate::catalog::{BackupDescriptor, BackupMode, BackupStatus, Catalog};
use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::executor::BackupExecutor;
use crate::filelist::{read_file_list, write_file_list, FileEntry, FileKind, BYTES_INVALID};
use crate::pagemap::{record_change, WalScanner, BLCKSZ, XLOG_BLCKSZ};
use crate::scanner::scan_data_directory;
use crate::server::{single_field, ServerApi};
use crate::utils::{file_exists, InterruptFlag};
use chrono::Local;
use std::time::Duration;

/// 要求的服务器主版本（9.4 系列；块大小另行单独确认）
const SERVER_MAJOR_VERSION: i64 = 904;

/// 一次备份运行的结果汇总
#[derive(Debug)]
pub struct BackupSummary {
    /// 最终描述符（状态为 Done）
    pub descriptor: BackupDescriptor,

    /// 清单中的普通文件总数
    pub total_files: u64,

    /// 实际复制的文件数
    pub copied_files: u64,

    /// 跳过的文件数（未修改或复制时已消失）
    pub skipped_files: u64,
}

/// 备份编排器
///
/// 驱动一次完整的备份尝试。与服务器和 WAL 扫描器之间都是窄接口，
/// 生产环境传入 psql 连接和真实扫描器，测试传入内存实现。
pub struct BackupOrchestrator<'a> {
    config: BackupConfig,
    catalog: Catalog,
    server: &'a mut dyn ServerApi,
    wal_scanner: &'a mut dyn WalScanner,
    interrupt: InterruptFlag,
    poll_interval: Duration,
    timeout_polls: u32,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(
        config: BackupConfig,
        server: &'a mut dyn ServerApi,
        wal_scanner: &'a mut dyn WalScanner,
        interrupt: InterruptFlag,
    ) -> Self {
        let catalog = Catalog::new(config.backup_path.clone());
        Self {
            config,
            catalog,
            server,
            wal_scanner,
            interrupt,
            poll_interval: Duration::from_secs(1),
            timeout_polls: 10,
        }
    }

    /// 覆盖归档等待的轮询节奏（默认每秒一次、上限 10 次）
    pub fn with_archive_polling(mut self, interval: Duration, polls: u32) -> Self {
        self.poll_interval = interval;
        self.timeout_polls = polls;
        self
    }

    /// 执行一次备份
    ///
    /// 流程：前置检查 → 取目录锁 → 持久化 `Running` 描述符 →
    /// 备份数据 → 标记 `Done` → 应用保留策略 → 释放锁。数据阶段
    /// 的任何错误都会走清理路径：关闭服务器侧备份括号并把描述符
    /// 标记为 `Error`，保证服务器和目录不会误以为备份仍在进行。
    pub fn run(&mut self) -> Result<BackupSummary> {
        // start-backup 之前的任何错误都是致命的、无副作用的，
        // 不做重试
        self.preflight()?;

        // 独占锁：另一个实例持有时快速失败
        let _lock = self.catalog.lock()?;

        let mut desc = BackupDescriptor::start(self.config.mode);
        desc.timeline = self.server.current_timeline()?;

        // 差异模式需要一个已完成的全量备份作为参照基准；
        // 在创建任何目录之前检查
        let backup_list = self.catalog.backup_list()?;
        let prev_backup = if self.config.mode == BackupMode::DifferentialPage {
            let prev = Catalog::last_done_full_backup(&backup_list, desc.timeline)
                .ok_or_else(|| {
                    BackupError::Catalog(
                        "valid full backup not found for differential backup; \
                         either create a full backup or validate existing one"
                            .into(),
                    )
                })?
                .clone();
            Some(prev)
        } else {
            None
        };

        // 在移动任何数据之前先落一条 Running 记录，
        // 中途崩溃的运行必须是可发现的
        if !self.config.dry_run {
            self.catalog.create_backup_dir(&desc)?;
            self.catalog.write_descriptor(&desc)?;
        }

        match self.backup_database(&mut desc, prev_backup.as_ref()) {
            Ok(files) => {
                desc.end_time = Some(Local::now());
                desc.status = BackupStatus::Done;
                if !self.config.dry_run {
                    self.catalog.write_descriptor(&desc)?;
                }

                self.catalog.apply_retention(
                    self.config.keep_generations,
                    self.config.keep_days,
                    self.config.dry_run,
                )?;

                Ok(summarize(desc, &files))
            }
            Err(e) => {
                self.cleanup(&mut desc);
                Err(e)
            }
        }
    }

    /// 前置检查：备用节点、服务器版本、块大小
    ///
    /// 复制目标节点（standby）永远不是这个协议的安全来源；
    /// 版本或块大小与编译期预期不符的服务器同样拒绝。
    fn preflight(&mut self) -> Result<()> {
        if !self.config.pgdata.is_dir() {
            return Err(BackupError::Configuration(format!(
                "PGDATA {:?} is not a directory",
                self.config.pgdata
            )));
        }

        if file_exists(&self.config.pgdata.join("recovery.conf")) {
            return Err(BackupError::EnvironmentRejected(
                "backup cannot run on a standby".into(),
            ));
        }

        let version = self.server.server_version()?;
        if version / 100 != SERVER_MAJOR_VERSION {
            return Err(BackupError::EnvironmentRejected(format!(
                "server version is {}.{}.{}, {}.{} expected",
                version / 10000,
                (version / 100) % 100,
                version % 100,
                SERVER_MAJOR_VERSION / 100,
                SERVER_MAJOR_VERSION % 100,
            )));
        }

        self.confirm_block_size("block_size", BLCKSZ as i64)?;
        self.confirm_block_size("wal_block_size", XLOG_BLCKSZ as i64)?;
        Ok(())
    }

    fn confirm_block_size(&mut self, name: &str, expected: i64) -> Result<()> {
        let rows = self
            .server
            .execute(&format!("SELECT current_setting('{name}')"))?;
        let value: i64 = single_field(&rows, name)?
            .trim()
            .parse()
            .map_err(|_| BackupError::Protocol(format!("cannot get {name}")))?;
        if value != expected {
            return Err(BackupError::EnvironmentRejected(format!(
                "{name}({value}) is not compatible({expected} expected)"
            )));
        }
        Ok(())
    }

    /// 备份数据目录：从 start-backup 到 stop-backup 的括号段
    fn backup_database(
        &mut self,
        desc: &mut BackupDescriptor,
        prev_backup: Option<&BackupDescriptor>,
    ) -> Result<Vec<FileEntry>> {
        let pgdata = self.config.pgdata.clone();
        let label = format!("{} with recoup", desc.start_time.format("%Y-%m-%d %H:%M:%S"));

        let mut coord = ArchiveCoordinator::new(&mut *self.server, &pgdata, self.interrupt.clone())
            .with_polling(self.poll_interval, self.timeout_polls);

        desc.start_lsn = coord.start_backup(&label, self.config.smooth_checkpoint)?;
        if !self.config.dry_run {
            self.catalog.write_descriptor(desc)?;
        }

        // backup_label 不在数据目录：start-backup 没有生效，
        // 先关闭括号再报错
        if !file_exists(&pgdata.join("backup_label")) {
            coord.stop_backup(None)?;
            return Err(BackupError::EnvironmentRejected(
                "backup_label does not exist in PGDATA".into(),
            ));
        }

        let patterns = self.config.compiled_patterns();
        let mut files = scan_data_directory(&pgdata, &patterns, false)?;

        // 差异模式：加载参照清单，并用归档里的 WAL 构建页面映射
        let mut prev_files = None;
        let mut ref_lsn = None;
        if let Some(prev) = prev_backup {
            let list_path = self.catalog.file_list_path(prev);
            prev_files = Some(read_file_list(&pgdata, &list_path)?);
            ref_lsn = Some(prev.start_lsn);

            // 覆盖 start_lsn 的段通常还没到归档：先强制切段并等它
            // 到位，否则扫描会静默漏掉最近的变更
            coord.switch_wal(Some(&mut *desc))?;

            let changes = self.wal_scanner.scan_changed_blocks(
                &self.config.arclog_path,
                prev.start_lsn,
                desc.timeline,
                desc.start_lsn,
            )?;
            for change in changes {
                record_change(&mut files, change);
            }
        }

        let database_dir = self.catalog.database_dir(desc);
        let executor = BackupExecutor::new(
            self.config.dry_run,
            self.config.verbose,
            self.interrupt.clone(),
        );
        let copy_result =
            executor.backup_files(&database_dir, &mut files, prev_files.as_deref(), ref_lsn, None);

        // 复制成败与否都要先通知服务器结束备份
        let stop_result = coord.stop_backup(Some(&mut *desc));
        copy_result?;
        stop_result?;

        if !self.config.dry_run {
            write_file_list(&files, &self.catalog.file_list_path(desc))?;
        }

        desc.data_bytes = aggregate_bytes(&files, desc.mode);
        Ok(files)
    }

    /// 异常终止的清理路径
    ///
    /// 幂等：backup_label 仍在数据目录里才需要通知服务器停止备份
    /// （start 未确认时它不存在，此时整个清理是空操作）；描述符
    /// 仍为 Running 且没有结束时间时补记 Error。清理自身的失败
    /// 不得掩盖原始错误，全部忽略。
    fn cleanup(&mut self, desc: &mut BackupDescriptor) {
        if file_exists(&self.config.pgdata.join("backup_label")) {
            let mut coord = ArchiveCoordinator::new(
                &mut *self.server,
                &self.config.pgdata,
                self.interrupt.clone(),
            )
            .with_polling(self.poll_interval, self.timeout_polls);
            // 错误场景下不关心 stop LSN
            let _ = coord.stop_backup(None);
        }

        if desc.status == BackupStatus::Running && desc.end_time.is_none() {
            desc.end_time = Some(Local::now());
            desc.status = BackupStatus::Error;
            if !self.config.dry_run {
                let _ = self.catalog.write_descriptor(desc);
            }
        }
    }
}

/// 聚合数据字节数
///
/// 只统计未被跳过的普通文件：全量备份累计写入量，差异备份累计
/// 读取量。
fn aggregate_bytes(files: &[FileEntry], mode: BackupMode) -> i64 {
    files
        .iter()
        .filter(|f| f.kind == FileKind::Regular && f.write_size != BYTES_INVALID)
        .map(|f| match mode {
            BackupMode::Full => f.write_size,
            BackupMode::DifferentialPage => f.read_size,
        })
        .sum()
}

fn summarize(descriptor: BackupDescriptor, files: &[FileEntry]) -> BackupSummary {
    let regular = files.iter().filter(|f| f.kind == FileKind::Regular);
    let (mut total, mut copied, mut skipped) = (0u64, 0u64, 0u64);
    for file in regular {
        total += 1;
        if file.write_size == BYTES_INVALID {
            skipped += 1;
        } else {
            copied += 1;
        }
    }
    BackupSummary {
        descriptor,
        total_files: total,
        copied_files: copied,
        skipped_files: skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filelist::FileEntry;
    use crate::lsn::{Lsn, TimelineId};
    use crate::pagemap::BlockChange;
    use crate::server::Rows;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    struct MockServer {
        version: i64,
        block_size: i64,
    }

    impl Default for MockServer {
        fn default() -> Self {
            Self {
                version: 90405,
                block_size: 8192,
            }
        }
    }

    impl ServerApi for MockServer {
        fn execute(&mut self, sql: &str) -> Result<Rows> {
            if sql.contains("current_setting('block_size')") {
                Ok(vec![vec![self.block_size.to_string()]])
            } else if sql.contains("current_setting('wal_block_size')") {
                Ok(vec![vec!["8192".to_string()]])
            } else if sql.contains("pg_start_backup") {
                Ok(vec![vec!["0/2000028".to_string()]])
            } else if sql.contains("pg_stop_backup") || sql.contains("pg_switch_xlog") {
                Ok(vec![vec!["0/2000100".to_string()]])
            } else if sql.contains("txid_current") {
                Ok(vec![vec!["512".to_string()]])
            } else {
                Ok(vec![])
            }
        }

        fn server_version(&mut self) -> Result<i64> {
            Ok(self.version)
        }

        fn current_timeline(&mut self) -> Result<TimelineId> {
            Ok(1)
        }
    }

    struct NoChanges;

    impl WalScanner for NoChanges {
        fn scan_changed_blocks(
            &mut self,
            _archive_path: &Path,
            _from_lsn: Lsn,
            _timeline: TimelineId,
            _to_lsn: Lsn,
        ) -> Result<Vec<BlockChange>> {
            Ok(Vec::new())
        }
    }

    fn config_for(pgdata: &Path, backup_path: &Path, mode: BackupMode) -> BackupConfig {
        BackupConfig {
            pgdata: pgdata.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
            arclog_path: backup_path.join("arclog"),
            mode,
            conninfo: None,
            smooth_checkpoint: true,
            keep_generations: None,
            keep_days: None,
            exclude_patterns: vec![],
            dry_run: false,
            verbose: false,
        }
    }

    #[test]
    fn standby_node_is_rejected_pre_flight() {
        let pgdata = tempdir().unwrap();
        let backups = tempdir().unwrap();
        fs::write(pgdata.path().join("recovery.conf"), "standby_mode = on").unwrap();

        let mut server = MockServer::default();
        let mut scanner = NoChanges;
        let mut orch = BackupOrchestrator::new(
            config_for(pgdata.path(), backups.path(), BackupMode::Full),
            &mut server,
            &mut scanner,
            InterruptFlag::new(),
        );

        assert!(matches!(
            orch.run(),
            Err(BackupError::EnvironmentRejected(_))
        ));
        // 前置检查失败不留任何备份目录
        assert!(backups.path().read_dir().unwrap().next().is_none());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let pgdata = tempdir().unwrap();
        let backups = tempdir().unwrap();

        let mut server = MockServer {
            version: 100005,
            ..Default::default()
        };
        let mut scanner = NoChanges;
        let mut orch = BackupOrchestrator::new(
            config_for(pgdata.path(), backups.path(), BackupMode::Full),
            &mut server,
            &mut scanner,
            InterruptFlag::new(),
        );
        assert!(matches!(
            orch.run(),
            Err(BackupError::EnvironmentRejected(_))
        ));
    }

    #[test]
    fn block_size_mismatch_is_rejected() {
        let pgdata = tempdir().unwrap();
        let backups = tempdir().unwrap();

        let mut server = MockServer {
            block_size: 16384,
            ..Default::default()
        };
        let mut scanner = NoChanges;
        let mut orch = BackupOrchestrator::new(
            config_for(pgdata.path(), backups.path(), BackupMode::Full),
            &mut server,
            &mut scanner,
            InterruptFlag::new(),
        );
        assert!(matches!(
            orch.run(),
            Err(BackupError::EnvironmentRejected(_))
        ));
    }

    #[test]
    fn differential_without_reference_full_backup_fails() {
        let pgdata = tempdir().unwrap();
        let backups = tempdir().unwrap();

        let mut server = MockServer::default();
        let mut scanner = NoChanges;
        let mut orch = BackupOrchestrator::new(
            config_for(pgdata.path(), backups.path(), BackupMode::DifferentialPage),
            &mut server,
            &mut scanner,
            InterruptFlag::new(),
        );

        match orch.run() {
            Err(BackupError::Catalog(msg)) => assert!(msg.contains("full backup not found")),
            other => panic!("expected Catalog error, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_counts_only_non_sentinel_regular_files() {
        let mut copied = FileEntry::new(
            PathBuf::from("/d/a"),
            PathBuf::from("a"),
            FileKind::Regular,
            10,
            0,
        );
        copied.write_size = 10;
        copied.read_size = 4;

        let mut skipped = copied.clone();
        skipped.rel_path = PathBuf::from("b");
        skipped.mark_skipped();

        let dir = FileEntry::new(
            PathBuf::from("/d/c"),
            PathBuf::from("c"),
            FileKind::Directory,
            0,
            0,
        );

        let files = vec![copied, skipped, dir];
        assert_eq!(aggregate_bytes(&files, BackupMode::Full), 10);
        assert_eq!(aggregate_bytes(&files, BackupMode::DifferentialPage), 4);
    }
}
