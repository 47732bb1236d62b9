// Recoup - 物理复制原语模块
// 整文件复制与页级变更块复制；两者在「没有东西可写」时返回
// Ok(false) 而不是错误（源文件消失、位图为空都属于正常情况）

use crate::error::{BackupError, Result};
use crate::filelist::FileEntry;
use crate::lsn::Lsn;
use crate::pagemap::BLCKSZ;
use filetime::FileTime;
use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// 把源文件原样复制到备份目标
///
/// 复制后保留源 mtime（下一次差异备份按位比较 mtime，目标侧的
/// 时间戳必须与清单一致）。源文件在复制前消失时返回 `Ok(false)`。
///
/// # 返回
/// * `Ok(true)` - 复制完成，write_size / read_size 已更新
/// * `Ok(false)` - 源文件已不存在，调用方应记为跳过
pub fn copy_whole_file(file: &mut FileEntry, dst: &Path) -> Result<bool> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
    }

    let src_meta = match fs::metadata(&file.path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(BackupError::io(&file.path, e)),
    };

    let bytes = match fs::copy(&file.path, dst) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(BackupError::io(&file.path, e)),
    };

    let mtime = FileTime::from_last_modification_time(&src_meta);
    let atime = FileTime::from_last_access_time(&src_meta);
    filetime::set_file_times(dst, atime, mtime).map_err(|e| BackupError::io(dst, e))?;

    file.write_size = bytes as i64;
    file.read_size = bytes as i64;
    Ok(true)
}

/// 通过页级路径复制一个关系数据文件
///
/// 三种情形：
/// * 无参照 LSN（全量备份）：逐页原样复制整个文件；
/// * 有参照 LSN 且条目持有位图：只复制位图标记的块，目标文件中
///   每个块前置 4 字节小端块号；
/// * 有参照 LSN 但没有位图：读取每页页首的 LSN，复制比参照更新
///   的页（格式同上）。
///
/// `read_size` 记录实际读取的字节数，`write_size` 记录写入目标的
/// 字节数。源文件消失或没有任何块需要写入时返回 `Ok(false)`。
pub fn copy_data_file(file: &mut FileEntry, dst: &Path, ref_lsn: Option<Lsn>) -> Result<bool> {
    // 空位图意味着没有任何块被改动，连源文件都不用打开
    if ref_lsn.is_some() && file.pagemap.as_ref().is_some_and(|m| m.is_empty()) {
        file.read_size = 0;
        return Ok(false);
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
    }

    let src = match fs::File::open(&file.path) {
        Ok(fp) => fp,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(BackupError::io(&file.path, e)),
    };

    match ref_lsn {
        None => copy_all_pages(file, src, dst),
        Some(lsn) => copy_newer_pages(file, src, dst, lsn),
    }
}

/// 全量路径：逐页读出并原样写入
fn copy_all_pages(file: &mut FileEntry, mut src: fs::File, dst: &Path) -> Result<bool> {
    let mut out = fs::File::create(dst).map_err(|e| BackupError::io(dst, e))?;
    let mut page = vec![0u8; BLCKSZ as usize];
    let mut read_bytes = 0i64;
    let mut written_bytes = 0i64;

    loop {
        let n = read_page(&mut src, &mut page, &file.path)?;
        if n == 0 {
            break;
        }
        out.write_all(&page[..n]).map_err(|e| BackupError::io(dst, e))?;
        read_bytes += n as i64;
        written_bytes += n as i64;
    }

    preserve_mtime(&file.path, dst)?;
    file.read_size = read_bytes;
    file.write_size = written_bytes;
    Ok(true)
}

/// 差异路径：只写入位图标记的块，或页首 LSN 比参照新的块
fn copy_newer_pages(file: &mut FileEntry, mut src: fs::File, dst: &Path, ref_lsn: Lsn) -> Result<bool> {
    let mut out = fs::File::create(dst).map_err(|e| BackupError::io(dst, e))?;
    let mut page = vec![0u8; BLCKSZ as usize];
    let mut read_bytes = 0i64;
    let mut written_bytes = 0i64;

    if let Some(pagemap) = file.pagemap.clone() {
        // 位图驱动：直接寻址到每个标记块
        for blkno in pagemap.iter() {
            let offset = blkno as u64 * BLCKSZ as u64;
            src.seek(SeekFrom::Start(offset))
                .map_err(|e| BackupError::io(&file.path, e))?;
            let n = read_page(&mut src, &mut page, &file.path)?;
            if n == 0 {
                // 关系在参照备份之后被截断，位图里的块已不存在
                continue;
            }
            read_bytes += n as i64;
            written_bytes += write_block(&mut out, dst, blkno, &page[..n])?;
        }
    } else {
        // 无位图：全文件扫描，按页首 LSN 过滤
        let mut blkno: u32 = 0;
        loop {
            let n = read_page(&mut src, &mut page, &file.path)?;
            if n == 0 {
                break;
            }
            read_bytes += n as i64;
            // 尾部不足 8 字节的残页没有可读的 LSN，一律视为已变更
            if n < 8 || page_lsn(&page) > ref_lsn {
                written_bytes += write_block(&mut out, dst, blkno, &page[..n])?;
            }
            blkno += 1;
        }
    }

    if written_bytes == 0 {
        // 没有块需要备份：丢弃空目标文件，记为跳过
        drop(out);
        let _ = fs::remove_file(dst);
        file.read_size = read_bytes;
        return Ok(false);
    }

    preserve_mtime(&file.path, dst)?;
    file.read_size = read_bytes;
    file.write_size = written_bytes;
    Ok(true)
}

/// 读满一页（文件尾部的不完整页按实际长度返回）
fn read_page(src: &mut fs::File, page: &mut [u8], src_path: &Path) -> Result<usize> {
    let mut filled = 0;
    while filled < page.len() {
        let n = src
            .read(&mut page[filled..])
            .map_err(|e| BackupError::io(src_path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 写入一条 (块号, 页数据) 记录，返回写入的字节数
fn write_block(out: &mut fs::File, dst: &Path, blkno: u32, page: &[u8]) -> Result<i64> {
    out.write_all(&blkno.to_le_bytes())
        .map_err(|e| BackupError::io(dst, e))?;
    out.write_all(page).map_err(|e| BackupError::io(dst, e))?;
    Ok(4 + page.len() as i64)
}

/// 页首 8 字节是该页最后一次修改的 LSN（高低各 32 位小端）
fn page_lsn(page: &[u8]) -> Lsn {
    let hi = u32::from_le_bytes([page[0], page[1], page[2], page[3]]);
    let lo = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);
    Lsn(((hi as u64) << 32) | lo as u64)
}

fn preserve_mtime(src: &Path, dst: &Path) -> Result<()> {
    let meta = match fs::metadata(src) {
        Ok(meta) => meta,
        // 源在复制后消失：目标内容仍然有效，保留当前时间戳
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BackupError::io(src, e)),
    };
    let mtime = FileTime::from_last_modification_time(&meta);
    let atime = FileTime::from_last_access_time(&meta);
    filetime::set_file_times(dst, atime, mtime).map_err(|e| BackupError::io(dst, e))
}
