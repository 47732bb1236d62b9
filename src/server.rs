// Recoup - 服务器连接模块
// 以窄接口封装与在线数据库服务器的协调调用

use crate::error::{BackupError, Result};
use crate::lsn::TimelineId;
use std::path::PathBuf;
use std::process::Command;

/// 服务器返回的文本表格结果（行 × 列）
pub type Rows = Vec<Vec<String>>;

/// 服务器协调接口
///
/// 备份核心只通过这个窄契约访问在线服务器：执行一条返回文本表格
/// 的命令、查询服务器版本号、查询当前时间线。连接管理本身不属于
/// 核心范围，测试中用内存实现替代。
pub trait ServerApi {
    /// 执行一条 SQL 命令并返回文本结果
    fn execute(&mut self, sql: &str) -> Result<Rows>;

    /// 服务器版本号（如 90421 表示 9.4.21）
    fn server_version(&mut self) -> Result<i64>;

    /// 集群当前时间线
    ///
    /// `pg_start_backup()` / `pg_stop_backup()` 的输出不包含时间线，
    /// 必须单独获取。
    fn current_timeline(&mut self) -> Result<TimelineId>;
}

/// 通过 `psql` 命令行访问服务器的生产实现
///
/// 使用 `psql --no-psqlrc -At`（无对齐、仅元组输出），列以制表符
/// 分隔，每行一个元组。时间线没有 SQL 查询接口，从集群的控制
/// 文件读取（`pg_controldata`）。
pub struct PsqlConnection {
    /// 连接字符串（如 `postgresql://localhost/postgres`），为空则使用
    /// psql 的环境变量默认值
    conninfo: Option<String>,

    /// 集群数据目录（pg_controldata 的参数）
    pgdata: PathBuf,
}

impl PsqlConnection {
    pub fn new(conninfo: Option<String>, pgdata: impl Into<PathBuf>) -> Self {
        Self {
            conninfo,
            pgdata: pgdata.into(),
        }
    }

    /// 运行一条命令并把输出按行、按制表符拆成表格
    fn run(&self, sql: &str) -> Result<Rows> {
        let mut cmd = Command::new("psql");
        cmd.arg("--no-psqlrc").arg("-At");
        if let Some(ref conninfo) = self.conninfo {
            cmd.arg("-d").arg(conninfo);
        }
        cmd.arg("-c").arg(sql);

        let output = cmd
            .output()
            .map_err(|e| BackupError::Protocol(format!("cannot run psql: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Protocol(format!(
                "server command failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|line| line.split('\t').map(|s| s.to_string()).collect())
            .collect())
    }
}

impl ServerApi for PsqlConnection {
    fn execute(&mut self, sql: &str) -> Result<Rows> {
        self.run(sql)
    }

    fn server_version(&mut self) -> Result<i64> {
        let rows = self.run("SHOW server_version_num")?;
        single_field(&rows, "server_version_num")?
            .parse()
            .map_err(|_| BackupError::Protocol("server_version_num is not a number".into()))
    }

    fn current_timeline(&mut self) -> Result<TimelineId> {
        let output = Command::new("pg_controldata")
            .arg(&self.pgdata)
            .output()
            .map_err(|e| BackupError::Protocol(format!("cannot run pg_controldata: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Protocol(format!(
                "pg_controldata failed: {}",
                stderr.trim()
            )));
        }

        parse_control_timeline(&String::from_utf8_lossy(&output.stdout))
    }
}

/// 从 pg_controldata 的输出里提取最近检查点的时间线
pub fn parse_control_timeline(text: &str) -> Result<TimelineId> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Latest checkpoint's TimeLineID:") {
            return rest.trim().parse().map_err(|_| {
                BackupError::Protocol("Latest checkpoint's TimeLineID is not a number".into())
            });
        }
    }
    Err(BackupError::Protocol(
        "pg_controldata output has no TimeLineID line".into(),
    ))
}

/// 校验结果恰好为一行一列并取出该字段
///
/// 备份协调命令都应返回单行单列，其它形状视为协议错误。
pub fn single_field<'a>(rows: &'a Rows, what: &str) -> Result<&'a str> {
    if rows.len() != 1 || rows[0].len() != 1 {
        return Err(BackupError::Protocol(format!(
            "result of {what} is invalid: expected 1 row and 1 column, got {} row(s)",
            rows.len()
        )));
    }
    Ok(&rows[0][0])
}

/// 把单引号转义后包进 SQL 字面量（用于备份标签等文本参数）
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
