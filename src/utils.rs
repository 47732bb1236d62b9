// Recoup - 工具函数模块
// 提供中断标志、模式匹配、格式化等辅助功能

use glob::Pattern;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 协作式中断标志
///
/// 由外部（信号处理或测试）置位，备份核心在每次归档轮询和复制
/// 循环的每个文件处检查。克隆共享同一个底层标志。
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求中断当前备份
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// 查询是否已请求中断
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// 检查路径是否匹配任一排除模式
///
/// # 参数
/// * `rel_path` - 要检查的相对路径
/// * `patterns` - Glob 模式列表
///
/// # 返回
/// * `true` - 路径匹配至少一个排除模式
pub fn matches_exclude_pattern(rel_path: &Path, patterns: &[Pattern]) -> bool {
    let path_str = rel_path.to_string_lossy();

    for pattern in patterns {
        if pattern.matches(&path_str) {
            return true;
        }
    }

    false
}

/// 检查路径是否为已存在的普通文件
///
/// 目录和其它类型都返回 false（与归档 `.ready` 标记以及
/// `backup_label` 的检测语义一致）。
pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

/// 格式化字节数为人类可读的单位
///
/// 将字节数自动转换为 B、KB、MB、GB 或 TB 单位。
///
/// # 示例
/// ```
/// use recoup::utils::format_bytes;
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(500), "500 B");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 格式化秒数为人类可读的时间长度
///
/// 将秒数转换为 "Xh Ym Zs" 或 "Xm Ys" 或 "Xs" 格式。
pub fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;
        format!("{}h {}m {}s", hours, mins, secs)
    } else if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
