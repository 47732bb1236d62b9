// Recoup - 备份执行器模块
// 复制阶段：把枚举清单与参照清单逐文件比对，决定复制 / 跳过 /
// 页级复制，并实际执行文件操作

use crate::copy::{copy_data_file, copy_whole_file};
use crate::error::{BackupError, Result};
use crate::filelist::{find_by_rel_path, FileEntry};
use crate::lsn::Lsn;
use crate::utils::InterruptFlag;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 备份执行器
///
/// 单线程顺序执行：枚举、WAL 扫描、复制严格按序进行，复制循环
/// 内部没有并行工作者。
pub struct BackupExecutor {
    /// 试运行模式（比对决策照常进行，但不写任何东西）
    dry_run: bool,

    /// 是否逐文件打印进度
    verbose: bool,

    /// 协作式中断标志（复制循环每个文件处检查一次）
    interrupt: InterruptFlag,
}

impl BackupExecutor {
    pub fn new(dry_run: bool, verbose: bool, interrupt: InterruptFlag) -> Self {
        Self {
            dry_run,
            verbose,
            interrupt,
        }
    }

    /// 执行一轮复制
    ///
    /// 清单先按逻辑路径升序排序（确定性顺序是对参照清单二分查找
    /// 的前提）。每个条目依次经过：时钟回拨检查、中断检查、stat、
    /// 目录创建或参照比对，最后走整文件或页级复制路径。
    ///
    /// # 参数
    /// * `to_root` - 本次备份的数据载荷目录
    /// * `prev_files` - 参照备份的文件清单（全量备份时为 None）
    /// * `ref_lsn` - 参照备份的起始 LSN（差异模式）
    /// * `prefix` - 枚举根与参照清单根不一致时（表空间迁移）的
    ///   逻辑路径前缀，比对前先拼接
    pub fn backup_files(
        &self,
        to_root: &Path,
        files: &mut [FileEntry],
        prev_files: Option<&[FileEntry]>,
        ref_lsn: Option<Lsn>,
        prefix: Option<&Path>,
    ) -> Result<()> {
        // 按逻辑路径升序；参照清单读取时已是同一顺序
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        let mut now = unix_seconds();
        let total = files.len();

        for (i, file) in files.iter_mut().enumerate() {
            // 当前时间早于文件自己的 mtime：系统时钟被回拨，
            // 继续做差异备份会漏数据，直接致命
            if now < file.mtime {
                return Err(BackupError::ClockRewind {
                    path: file.path.clone(),
                });
            }

            if self.interrupt.is_raised() {
                return Err(BackupError::Interrupted("backup".into()));
            }

            if self.verbose {
                match &file.pagemap {
                    Some(map) => pb.println(format!(
                        "({}/{}) {:?} ({} blocks)",
                        i + 1,
                        total,
                        file.rel_path,
                        map.block_count()
                    )),
                    None => pb.println(format!("({}/{}) {:?}", i + 1, total, file.rel_path)),
                }
            }
            pb.inc(1);

            // 枚举和复制之间文件可能被并发删除（如临时文件），
            // 记为跳过而不是错误
            let meta = match fs::symlink_metadata(&file.path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    file.mark_skipped();
                    continue;
                }
                Err(e) => return Err(BackupError::io(&file.path, e)),
            };

            if meta.is_dir() {
                // 目录只重建，从不参与变更比较
                if !self.dry_run {
                    let dirpath = to_root.join(&file.rel_path);
                    fs::create_dir_all(&dirpath).map_err(|e| BackupError::io(&dirpath, e))?;
                }
                continue;
            }

            if !meta.is_file() {
                // 套接字等特殊文件不复制
                file.mark_skipped();
                continue;
            }

            // 与参照清单比对：mtime 按位相同的文件直接跳过，
            // 这是非数据文件和未变更数据文件增量收益的核心
            if let Some(prev_files) = prev_files {
                let prev = match prefix {
                    // 表空间从别的挂载点备份时参照根不同，拼接
                    // 前缀后线性扫描（表空间数量很少）
                    Some(prefix) => {
                        let remapped = prefix.join(&file.rel_path);
                        prev_files.iter().find(|p| p.rel_path == remapped)
                    }
                    None => find_by_rel_path(prev_files, &file.rel_path),
                };

                if let Some(prev) = prev {
                    if prev.mtime == file.mtime {
                        file.mark_skipped();
                        continue;
                    }
                }
            }

            // mtime 与当前秒相同的文件要等时钟走过这一秒再复制：
            // mtime 精度只有一秒，同一秒内的再次修改否则会被下次
            // 差异备份漏掉。这是正确性要求，不是可删的延迟。
            if now == file.mtime {
                wait_past_second(file.mtime);
                now = unix_seconds();
            }

            if self.dry_run {
                continue;
            }

            let dst = to_root.join(&file.rel_path);
            let copied = if file.is_datafile {
                copy_data_file(file, &dst, ref_lsn)?
            } else {
                copy_whole_file(file, &dst)?
            };

            // 复制原语「没写任何东西」（源因正当理由消失等）
            // 同样记为跳过
            if !copied {
                file.mark_skipped();
            }
        }

        pb.finish_and_clear();
        Ok(())
    }
}

/// 当前 Unix 时间（秒）
fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// 阻塞到墙钟严格越过 `mtime` 所在的那一秒
fn wait_past_second(mtime: i64) {
    loop {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        if now.as_secs() as i64 > mtime {
            return;
        }
        let to_next_second = Duration::from_nanos(1_000_000_000 - now.subsec_nanos() as u64);
        thread::sleep(to_next_second);
    }
}
