// Recoup - 数据目录扫描模块
// 负责枚举集群数据目录，归一化为按逻辑路径排序的文件清单，
// 并按磁盘命名约定把条目分类为关系数据文件 / 普通文件

use crate::error::{BackupError, Result};
use crate::filelist::{FileEntry, FileKind};
use crate::utils::matches_exclude_pattern;
use glob::Pattern;
use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// 固定排除集：可再生成或不能原样复制的路径
///
/// WAL 与日志目录单独归档、临时文件与锁 / 套接字文件复制无意义，
/// 统统排除在清单之外。
const PGDATA_EXCLUDE: &[&str] = &[
    "pg_xlog",
    "pg_log",
    "pg_stat_tmp",
    "pgsql_tmp",
    "postmaster.pid",
    "postmaster.opts",
];

/// 关系文件所在的三个存储前缀
const RELATION_STORAGE_PREFIXES: &[&str] = &["base", "global", "pg_tblspc"];

/// 枚举数据目录，生成归一化的文件清单
///
/// 遍历 `root` 下的整棵目录树（不跟随符号链接），跳过固定排除集
/// 和用户排除模式，生成以 `root` 为基准的逻辑路径条目。返回的
/// 清单总是按逻辑路径升序排序——后续对参照清单的二分查找依赖
/// 这一确定性顺序。
///
/// # 参数
/// * `root` - 集群数据目录
/// * `exclude_patterns` - 用户附加的 Glob 排除模式
/// * `include_root` - 是否包含 `root` 本身的目录条目
pub fn scan_data_directory(
    root: &Path,
    exclude_patterns: &[Pattern],
    include_root: bool,
) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();

    let min_depth = if include_root { 0 } else { 1 };
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(min_depth)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            if PGDATA_EXCLUDE.iter().any(|ex| *ex == name) {
                return false;
            }
            match e.path().strip_prefix(root) {
                Ok(rel) => !matches_exclude_pattern(rel, exclude_patterns),
                Err(_) => true,
            }
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(|p| p.to_path_buf()).unwrap_or_default();
            match e.into_io_error() {
                Some(io) => BackupError::io(path, io),
                None => BackupError::Catalog("directory walk hit a filesystem loop".into()),
            }
        })?;

        let path = entry.path().to_path_buf();
        let rel_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let meta = entry.metadata().map_err(|e| {
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walkdir loop"));
            BackupError::io(&path, io)
        })?;

        let kind = if meta.file_type().is_symlink() {
            FileKind::Other
        } else if meta.is_dir() {
            FileKind::Directory
        } else if meta.is_file() {
            FileKind::Regular
        } else {
            FileKind::Other
        };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut file = FileEntry::new(path, rel_path, kind, meta.len(), mtime);
        file.is_datafile = kind == FileKind::Regular && is_data_file_path(&file.rel_path);
        files.push(file);
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

/// 判断逻辑路径是否指向关系数据文件
///
/// 数据文件必须位于三个关系存储前缀之一下，且基础文件名以数字
/// 开头（磁盘上关系文件的命名约定）。其它普通文件一律走整文件
/// 复制，不做页级推理。
pub fn is_data_file_path(rel_path: &Path) -> bool {
    let under_storage = rel_path
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .map(|first| RELATION_STORAGE_PREFIXES.contains(&first))
        .unwrap_or(false);
    if !under_storage {
        return false;
    }

    rel_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.chars().next())
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    /// 构造一个最小的集群目录：backup_label 和一个关系文件
    fn make_cluster() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("base/1")).unwrap();
        fs::create_dir_all(dir.path().join("pg_xlog/archive_status")).unwrap();
        fs::write(dir.path().join("backup_label"), "LABEL").unwrap();
        fs::write(dir.path().join("base/1/16384"), vec![0u8; 8192]).unwrap();
        fs::write(dir.path().join("postmaster.pid"), "42").unwrap();
        dir
    }

    #[test]
    fn enumeration_is_sorted_and_classified() {
        let dir = make_cluster();
        let files = scan_data_directory(dir.path(), &[], false).unwrap();

        let rels: Vec<_> = files.iter().map(|f| f.rel_path.clone()).collect();
        let mut sorted = rels.clone();
        sorted.sort();
        assert_eq!(rels, sorted);

        // pg_xlog 与 postmaster.pid 被固定排除集过滤
        assert!(!rels.iter().any(|p| p.starts_with("pg_xlog")));
        assert!(!rels.contains(&PathBuf::from("postmaster.pid")));

        let datafile = files
            .iter()
            .find(|f| f.rel_path == PathBuf::from("base/1/16384"))
            .unwrap();
        assert!(datafile.is_datafile);
        assert_eq!(datafile.size, 8192);

        let label = files
            .iter()
            .find(|f| f.rel_path == PathBuf::from("backup_label"))
            .unwrap();
        assert!(!label.is_datafile);
    }

    #[test]
    fn enumeration_is_idempotent() {
        let dir = make_cluster();
        let first = scan_data_directory(dir.path(), &[], false).unwrap();
        let second = scan_data_directory(dir.path(), &[], false).unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.rel_path, b.rel_path);
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.size, b.size);
            assert_eq!(a.mtime, b.mtime);
            assert_eq!(a.is_datafile, b.is_datafile);
        }
    }

    #[test]
    fn user_exclude_patterns_are_honored() {
        let dir = make_cluster();
        let patterns = vec![Pattern::new("backup_label").unwrap()];
        let files = scan_data_directory(dir.path(), &patterns, false).unwrap();
        assert!(!files
            .iter()
            .any(|f| f.rel_path == PathBuf::from("backup_label")));
    }

    #[test]
    fn data_file_classification_rules() {
        assert!(is_data_file_path(Path::new("base/1/16384")));
        assert!(is_data_file_path(Path::new("global/1262")));
        assert!(is_data_file_path(Path::new("base/1/16384.2")));
        // 非数字开头的文件名不是数据文件
        assert!(!is_data_file_path(Path::new("base/1/PG_VERSION")));
        assert!(!is_data_file_path(Path::new("global/pg_control")));
        // 存储前缀之外的数字文件名也不是
        assert!(!is_data_file_path(Path::new("pg_clog/0000")));
        assert!(!is_data_file_path(Path::new("backup_label")));
    }
}
