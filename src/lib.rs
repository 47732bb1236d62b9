// Recoup - PostgreSQL 时间点恢复备份引擎
// 模块声明文件

/// 归档协调模块（备份括号与有界归档等待）
pub mod archive;

/// 备份编排模块（顶层状态机）
pub mod backup;

/// 备份目录模块（描述符、锁和保留策略）
pub mod catalog;

/// 备份运行配置模块
pub mod config;

/// 文件复制原语模块（整文件与页级复制）
pub mod copy;

/// 错误类型模块
pub mod error;

/// 备份执行器模块（增量复制决策）
pub mod executor;

/// 文件清单模块（备份文件列表的读写）
pub mod filelist;

/// WAL 位置（LSN）模块
pub mod lsn;

/// 页级变更追踪模块
pub mod pagemap;

/// 备份清理模块（删除旧备份）
pub mod prune;

/// 数据目录扫描模块
pub mod scanner;

/// 服务器控制通道模块
pub mod server;

/// 配置文件存储模块
pub mod store;

/// 工具函数模块
pub mod utils;
