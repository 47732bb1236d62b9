// Recoup - 归档协调模块
// 向在线服务器发出 start/stop-backup 请求，并把异步的 WAL 归档
// 完成事件转换为有界的同步等待

use crate::catalog::BackupDescriptor;
use crate::error::{BackupError, Result};
use crate::lsn::{Lsn, TimelineId};
use crate::server::{quote_literal, single_field, ServerApi};
use crate::utils::{file_exists, InterruptFlag};
use chrono::Local;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// 等待 WAL 归档完成的轮询上限（每秒一次）
const TIMEOUT_ARCHIVE: u32 = 10;

/// 归档状态标记文件所在的子目录
const ARCHIVE_STATUS_DIR: &str = "pg_xlog/archive_status";

/// 一次归档等待的结果，由调用方立即消费，从不单独持久化
#[derive(Debug, Clone, Copy)]
pub struct ArchiveWaitResult {
    pub timeline: TimelineId,
    pub lsn: Lsn,
    pub xid: Option<u32>,
}

/// 归档协调器
///
/// 服务器的 stop/switch 命令只返回一个 LSN；该 LSN 在归档中的
/// 持久性要通过归档进程的副信道——段文件 `.ready` 标记的消失——
/// 间接观察，协调协议里不存在同步的「归档完成」应答。
pub struct ArchiveCoordinator<'a> {
    server: &'a mut dyn ServerApi,
    pgdata: PathBuf,
    interrupt: InterruptFlag,
    poll_interval: Duration,
    timeout_polls: u32,
}

impl<'a> ArchiveCoordinator<'a> {
    pub fn new(server: &'a mut dyn ServerApi, pgdata: impl Into<PathBuf>, interrupt: InterruptFlag) -> Self {
        Self {
            server,
            pgdata: pgdata.into(),
            interrupt,
            poll_interval: Duration::from_secs(1),
            timeout_polls: TIMEOUT_ARCHIVE,
        }
    }

    /// 覆盖轮询节奏（默认每秒一次、上限 10 次）
    pub fn with_polling(mut self, interval: Duration, polls: u32) -> Self {
        self.poll_interval = interval;
        self.timeout_polls = polls;
        self
    }

    /// 通知服务器开始备份并取回起始 LSN
    ///
    /// `smooth` 为 true 时让检查点 I/O 平滑展开，false 则立即强制
    /// 检查点。结果必须恰好是一行一列。
    pub fn start_backup(&mut self, label: &str, smooth: bool) -> Result<Lsn> {
        let sql = format!(
            "SELECT pg_start_backup({}, {})",
            quote_literal(label),
            // 第二个参数是 'fast'
            if smooth { "false" } else { "true" },
        );
        let rows = self.server.execute(&sql)?;
        Lsn::parse(single_field(&rows, "pg_start_backup()")?)
    }

    /// 通知服务器结束备份并等待对应 WAL 段归档完成
    ///
    /// 清理路径上可以不带描述符调用（此时不需要记录 stop LSN）。
    pub fn stop_backup(&mut self, desc: Option<&mut BackupDescriptor>) -> Result<ArchiveWaitResult> {
        self.wait_for_archive(desc, "SELECT * FROM pg_stop_backup()")
    }

    /// 强制切换当前 WAL 段并等待它归档完成
    ///
    /// 差异备份在扫描归档之前调用，确保覆盖当前 LSN 的段确实已经
    /// 到达归档——否则扫描会静默漏掉最近的变更。
    pub fn switch_wal(&mut self, desc: Option<&mut BackupDescriptor>) -> Result<ArchiveWaitResult> {
        self.wait_for_archive(desc, "SELECT * FROM pg_switch_xlog()")
    }

    /// 执行一条返回 LSN 的服务器命令，然后等待对应段的 `.ready`
    /// 标记从归档状态目录消失
    ///
    /// 轮询间隔一秒、上限 10 次；超限视为归档进程卡住或配置错误，
    /// 是致命的 `ArchiveTimeout`。轮询期间观察到外部中断则立即以
    /// `Interrupted` 中止（与超时在诊断上区分开）。
    pub fn wait_for_archive(
        &mut self,
        desc: Option<&mut BackupDescriptor>,
        sql: &str,
    ) -> Result<ArchiveWaitResult> {
        // 压掉后端产生的 NOTICE 噪音
        self.server.execute("SET client_min_messages = warning")?;

        let rows = self.server.execute(sql)?;
        let lsn = Lsn::parse(single_field(&rows, sql)?)?;

        // stop/switch 的输出不含时间线，单独取一次
        let timeline = self.server.current_timeline()?;

        // 恢复点：当前事务 id 与取样时刻
        let xid_rows = self.server.execute("SELECT txid_current()")?;
        let xid: u64 = single_field(&xid_rows, "txid_current()")?
            .parse()
            .map_err(|_| BackupError::Protocol("result of txid_current() is invalid".into()))?;
        let xid = xid as u32;

        if let Some(desc) = desc {
            desc.timeline = timeline;
            desc.stop_lsn = lsn;
            desc.recovery_xid = xid;
            desc.recovery_time = Some(Local::now());
        }

        let segment = lsn.segment_file_name(timeline);
        let ready_path = self
            .pgdata
            .join(ARCHIVE_STATUS_DIR)
            .join(format!("{segment}.ready"));

        let mut try_count = 0u32;
        while file_exists(&ready_path) {
            thread::sleep(self.poll_interval);
            if self.interrupt.is_raised() {
                return Err(BackupError::Interrupted("waiting for WAL archiving".into()));
            }
            try_count += 1;
            if try_count > self.timeout_polls {
                return Err(BackupError::ArchiveTimeout {
                    segment,
                    seconds: self.timeout_polls as u64,
                });
            }
        }

        Ok(ArchiveWaitResult {
            timeline,
            lsn,
            xid: Some(xid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackupMode;
    use crate::server::Rows;
    use std::fs;
    use tempfile::tempdir;

    /// 按脚本应答协调命令的内存服务器
    struct MockServer {
        stop_lsn: &'static str,
        timeline: TimelineId,
        log: Vec<String>,
    }

    impl MockServer {
        fn new(stop_lsn: &'static str, timeline: TimelineId) -> Self {
            Self {
                stop_lsn,
                timeline,
                log: Vec::new(),
            }
        }
    }

    impl ServerApi for MockServer {
        fn execute(&mut self, sql: &str) -> Result<Rows> {
            self.log.push(sql.to_string());
            if sql.contains("pg_start_backup") {
                Ok(vec![vec!["0/2000028".to_string()]])
            } else if sql.contains("pg_stop_backup") || sql.contains("pg_switch_xlog") {
                Ok(vec![vec![self.stop_lsn.to_string()]])
            } else if sql.contains("txid_current") {
                Ok(vec![vec!["512".to_string()]])
            } else {
                Ok(vec![])
            }
        }

        fn server_version(&mut self) -> Result<i64> {
            Ok(90421)
        }

        fn current_timeline(&mut self) -> Result<TimelineId> {
            Ok(self.timeline)
        }
    }

    #[test]
    fn start_backup_parses_single_field_lsn() {
        let dir = tempdir().unwrap();
        let mut server = MockServer::new("0/2000100", 1);
        let mut coord =
            ArchiveCoordinator::new(&mut server, dir.path(), InterruptFlag::new());

        let lsn = coord.start_backup("2024-01-01 00:00:00 with recoup", true).unwrap();
        assert_eq!(lsn, Lsn::parse("0/2000028").unwrap());
        // smooth=true 映射为 fast=false
        assert!(server.log.iter().any(|s| s.contains("false")));
    }

    #[test]
    fn stop_backup_fills_descriptor_fields() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(ARCHIVE_STATUS_DIR)).unwrap();

        let mut server = MockServer::new("0/2000100", 1);
        let mut coord = ArchiveCoordinator::new(&mut server, dir.path(), InterruptFlag::new());

        let mut desc = BackupDescriptor::start(BackupMode::Full);
        let result = coord.stop_backup(Some(&mut desc)).unwrap();

        assert_eq!(result.timeline, 1);
        assert_eq!(result.lsn, Lsn::parse("0/2000100").unwrap());
        assert_eq!(result.xid, Some(512));
        assert_eq!(desc.stop_lsn, result.lsn);
        assert_eq!(desc.recovery_xid, 512);
        assert!(desc.recovery_time.is_some());
    }

    #[test]
    fn lingering_ready_marker_times_out() {
        let dir = tempdir().unwrap();
        let status_dir = dir.path().join(ARCHIVE_STATUS_DIR);
        fs::create_dir_all(&status_dir).unwrap();

        // 段名由 stop LSN 和时间线推出：0/2000100 位于段 2
        fs::write(status_dir.join("000000010000000000000002.ready"), "").unwrap();

        let mut server = MockServer::new("0/2000100", 1);
        let mut coord = ArchiveCoordinator::new(&mut server, dir.path(), InterruptFlag::new())
            .with_polling(Duration::from_millis(5), 10);

        match coord.stop_backup(None) {
            Err(BackupError::ArchiveTimeout { segment, .. }) => {
                assert_eq!(segment, "000000010000000000000002");
            }
            other => panic!("expected ArchiveTimeout, got {other:?}"),
        }
    }

    #[test]
    fn interrupt_during_polling_is_distinct_from_timeout() {
        let dir = tempdir().unwrap();
        let status_dir = dir.path().join(ARCHIVE_STATUS_DIR);
        fs::create_dir_all(&status_dir).unwrap();
        let ready = status_dir.join("000000010000000000000002.ready");
        fs::write(&ready, "").unwrap();

        let interrupt = InterruptFlag::new();
        let raiser = interrupt.clone();
        // 第三次轮询前后置位中断
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(25));
            raiser.raise();
        });

        let mut server = MockServer::new("0/2000100", 1);
        let mut coord = ArchiveCoordinator::new(&mut server, dir.path(), interrupt)
            .with_polling(Duration::from_millis(10), 1000);

        match coord.stop_backup(None) {
            Err(BackupError::Interrupted(_)) => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn wait_returns_once_marker_is_gone() {
        let dir = tempdir().unwrap();
        let status_dir = dir.path().join(ARCHIVE_STATUS_DIR);
        fs::create_dir_all(&status_dir).unwrap();
        let ready = status_dir.join("000000010000000000000002.ready");
        fs::write(&ready, "").unwrap();

        let remover = ready.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            fs::remove_file(remover).unwrap();
        });

        let mut server = MockServer::new("0/2000100", 1);
        let mut coord = ArchiveCoordinator::new(&mut server, dir.path(), InterruptFlag::new())
            .with_polling(Duration::from_millis(10), 100);

        let result = coord.stop_backup(None).unwrap();
        assert_eq!(result.lsn, Lsn::parse("0/2000100").unwrap());
        handle.join().unwrap();
    }
}
