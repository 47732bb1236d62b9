// Recoup - 备份清理模块
// 独立的清理入口，帮助管理备份目录的磁盘空间

use crate::catalog::Catalog;
use crate::error::Result;
use console::style;
use std::path::Path;

/// 清理超出保留范围的旧备份
///
/// 保留规则委托给目录层：保留最近 `keep_generations` 个完成的
/// 全量备份（连同比它们更新的差异备份），以及 `keep_days` 天以内
/// 的所有备份。两个参数都未指定时什么都不删。
///
/// # 参数
/// * `backup_path` - 备份目录根
/// * `keep_generations` - 要保留的完成全量备份代数
/// * `keep_days` - 要保留的天数
/// * `dry_run` - 试运行模式（只打印、不删除）
///
/// # 返回
/// * `Ok(usize)` - 删除（或将要删除）的备份数量
pub fn prune_backups(
    backup_path: &Path,
    keep_generations: Option<usize>,
    keep_days: Option<i64>,
    dry_run: bool,
) -> Result<usize> {
    let catalog = Catalog::new(backup_path);

    // 清理期间同样需要独占锁，避免和进行中的备份互相踩踏
    let _lock = catalog.lock()?;

    if keep_generations.is_none() && keep_days.is_none() {
        println!("No retention policy given. Nothing to prune.");
        return Ok(0);
    }

    let deleted = catalog.apply_retention(keep_generations, keep_days, dry_run)?;

    if deleted == 0 {
        println!("All backups are within the retention policy. Nothing to prune.");
    } else if !dry_run {
        println!(
            "{}",
            style(format!("Pruned {} old backup(s).", deleted))
                .green()
                .bold()
        );
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prune_without_policy_is_a_no_op() {
        let dir = tempdir().unwrap();
        let deleted = prune_backups(dir.path(), None, None, false).unwrap();
        assert_eq!(deleted, 0);
    }

    #[test]
    fn prune_on_empty_catalog_deletes_nothing() {
        let dir = tempdir().unwrap();
        let deleted = prune_backups(dir.path(), Some(1), None, false).unwrap();
        assert_eq!(deleted, 0);
    }

    #[test]
    fn prune_releases_lock_afterwards() {
        let dir = tempdir().unwrap();
        prune_backups(dir.path(), Some(1), None, true).unwrap();
        // 锁在返回时释放，第二次调用不会冲突
        prune_backups(dir.path(), Some(1), None, true).unwrap();
    }
}
