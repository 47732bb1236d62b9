// Recoup - 错误类型定义模块
// 定义备份引擎核心的错误分类，所有致命错误都会中止当前备份

use std::path::PathBuf;
use thiserror::Error;

/// 备份引擎错误枚举
///
/// 所有变体都是致命错误：检测到后当前备份立即中止。
/// 唯一的内部重试是归档等待的有界轮询（见 `ArchiveTimeout`）。
#[derive(Error, Debug)]
pub enum BackupError {
    /// 缺少必需参数（如数据目录或备份模式）
    #[error("Required parameter not specified: {0}")]
    Configuration(String),

    /// 运行环境被拒绝（备用节点、版本或块大小不匹配）
    #[error("Environment rejected: {0}")]
    EnvironmentRejected(String),

    /// 备份目录已被另一个实例锁定（不重试）
    #[error("Another recoup instance is running, skipping this backup")]
    ConcurrencyConflict,

    /// 服务器返回了意外的结果形状
    #[error("Invalid result of server command: {0}")]
    Protocol(String),

    /// 等待 WAL 归档超时（归档进程可能卡住或配置错误）
    #[error("Switched WAL segment {segment} could not be archived in {seconds} seconds")]
    ArchiveTimeout { segment: String, seconds: u64 },

    /// 收到外部中断信号
    #[error("Interrupted during {0}")]
    Interrupted(String),

    /// 检测到系统时钟回拨（需要以全量模式重新运行）
    #[error("Current time may be rewound at {path:?}. Please retry with full backup mode")]
    ClockRewind { path: PathBuf },

    /// 文件系统错误（NotFound 不属于此类，视为良性跳过）
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 备份目录（catalog）操作失败
    #[error("Backup catalog error: {0}")]
    Catalog(String),
}

impl BackupError {
    /// 为文件系统错误附加出错路径
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }
}

/// 核心模块统一使用的 Result 别名
pub type Result<T> = std::result::Result<T, BackupError>;
