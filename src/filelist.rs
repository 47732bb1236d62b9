// Recoup - 备份文件清单模块
// 定义文件条目结构，并负责文件清单记录的持久化读写
// 该清单是下一次差异备份的参照基准，格式必须无损往返

use crate::error::{BackupError, Result};
use crate::pagemap::PageBitmap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// 「已跳过」哨兵值
///
/// 文件在复制阶段被跳过（未修改、复制时已消失等）时记录的
/// write_size，用于区分「写了 0 字节」和「根本没有复制」。
pub const BYTES_INVALID: i64 = -1;

/// 文件系统条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// 普通文件
    Regular,
    /// 目录
    Directory,
    /// 其它（套接字、符号链接等，不参与复制）
    Other,
}

impl FileKind {
    fn as_char(self) -> char {
        match self {
            FileKind::Regular => 'F',
            FileKind::Directory => 'D',
            FileKind::Other => 'O',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'F' => Some(FileKind::Regular),
            'D' => Some(FileKind::Directory),
            'O' => Some(FileKind::Other),
            _ => None,
        }
    }
}

/// 备份文件条目
///
/// 枚举阶段创建，复制阶段填充 write_size / read_size / pagemap，
/// 最终序列化进本次备份的文件清单。条目不会跨备份存活；上一次
/// 备份的清单以只读参照数据的形式重新加载。
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// 绝对路径
    pub path: PathBuf,

    /// 相对枚举根的逻辑路径（清单中记录的就是它）
    pub rel_path: PathBuf,

    /// 条目类型
    pub kind: FileKind,

    /// 枚举时的文件大小（字节）
    pub size: u64,

    /// 修改时间（Unix 秒，与参照清单按位比较）
    pub mtime: i64,

    /// 是否为关系数据文件（可走页级复制路径）
    pub is_datafile: bool,

    /// 实际写入目标的字节数，BYTES_INVALID 表示已跳过
    pub write_size: i64,

    /// 页级扫描期间读取的字节数
    pub read_size: i64,

    /// 自参照 LSN 以来变更块的位图（仅差异模式的数据文件持有）
    pub pagemap: Option<PageBitmap>,
}

impl FileEntry {
    /// 从枚举信息创建新条目
    pub fn new(path: PathBuf, rel_path: PathBuf, kind: FileKind, size: u64, mtime: i64) -> Self {
        Self {
            path,
            rel_path,
            kind,
            size,
            mtime,
            is_datafile: false,
            write_size: 0,
            read_size: 0,
            pagemap: None,
        }
    }

    /// 标记为已跳过（记录哨兵值）
    pub fn mark_skipped(&mut self) {
        self.write_size = BYTES_INVALID;
    }
}

/// 在按逻辑路径升序排序的清单中二分查找条目
///
/// 排序是前置条件：枚举结束后、复制开始前清单已按 rel_path 排序。
pub fn find_by_rel_path<'a>(sorted: &'a [FileEntry], rel_path: &Path) -> Option<&'a FileEntry> {
    sorted
        .binary_search_by(|entry| entry.rel_path.as_path().cmp(rel_path))
        .ok()
        .map(|idx| &sorted[idx])
}

/// 把文件清单写入持久化记录
///
/// 每行一个条目，制表符分隔：
/// `逻辑路径  类型字符  大小  mtime  write_size  datafile 标志`。
/// 字段顺序与编码是兼容面，读写双方必须无损往返。
pub fn write_file_list(files: &[FileEntry], dest: &Path) -> Result<()> {
    let mut out = String::new();
    for file in files {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            file.rel_path.display(),
            file.kind.as_char(),
            file.size,
            file.mtime,
            file.write_size,
            if file.is_datafile { 1 } else { 0 },
        ));
    }

    let mut fp = fs::File::create(dest).map_err(|e| BackupError::io(dest, e))?;
    fp.write_all(out.as_bytes())
        .map_err(|e| BackupError::io(dest, e))?;
    Ok(())
}

/// 读取一份既有的文件清单作为参照
///
/// `root` 用于重建条目的绝对路径。返回的清单按逻辑路径升序，
/// 供复制阶段二分查找。
pub fn read_file_list(root: &Path, list_path: &Path) -> Result<Vec<FileEntry>> {
    let content = fs::read_to_string(list_path).map_err(|e| BackupError::io(list_path, e))?;

    let mut files = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return Err(BackupError::Catalog(format!(
                "malformed file list {list_path:?} at line {}",
                lineno + 1
            )));
        }

        let parse_err = || {
            BackupError::Catalog(format!(
                "malformed file list {list_path:?} at line {}",
                lineno + 1
            ))
        };

        let rel_path = PathBuf::from(fields[0]);
        let kind = fields[1]
            .chars()
            .next()
            .and_then(FileKind::from_char)
            .ok_or_else(parse_err)?;
        let size: u64 = fields[2].parse().map_err(|_| parse_err())?;
        let mtime: i64 = fields[3].parse().map_err(|_| parse_err())?;
        let write_size: i64 = fields[4].parse().map_err(|_| parse_err())?;
        let is_datafile = fields[5] == "1";

        let mut entry = FileEntry::new(root.join(&rel_path), rel_path, kind, size, mtime);
        entry.write_size = write_size;
        entry.is_datafile = is_datafile;
        files.push(entry);
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}
