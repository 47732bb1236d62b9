// Recoup - LSN 与 WAL 段命名模块
// 处理预写日志位置（LSN）的解析、显示和归档段文件名推导

use crate::error::{BackupError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// WAL 段大小（16 MiB，服务器编译期常量）
pub const WAL_SEG_SIZE: u64 = 16 * 1024 * 1024;

/// 每个 xlogid（高 32 位）包含的 WAL 段数
const SEGMENTS_PER_XLOG_ID: u64 = 0x1_0000_0000 / WAL_SEG_SIZE;

/// 时间线标识符（恢复分支时递增）
pub type TimelineId = u32;

/// 预写日志中的位置（Log Sequence Number）
///
/// 64 位单调递增值。与服务器交换时使用 `X/X` 文本格式，
/// 高 32 位和低 32 位分别以十六进制表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// 从服务器返回的 `X/X` 文本形式解析 LSN
    ///
    /// `pg_start_backup()` / `pg_stop_backup()` 等命令返回的位置形如
    /// `0/2000028`，斜杠前后分别是高低 32 位的十六进制值。
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (hi, lo) = text
            .split_once('/')
            .ok_or_else(|| BackupError::Protocol(format!("invalid LSN text: {text:?}")))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| BackupError::Protocol(format!("invalid LSN text: {text:?}")))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| BackupError::Protocol(format!("invalid LSN text: {text:?}")))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }

    /// LSN 所在 WAL 段的序号
    pub fn segment_no(self) -> u64 {
        self.0 / WAL_SEG_SIZE
    }

    /// 推导该 LSN 所在归档段的文件名
    ///
    /// 格式为 24 个十六进制字符：时间线、xlogid、段内序号各占 8 位。
    pub fn segment_file_name(self, tli: TimelineId) -> String {
        let segno = self.segment_no();
        format!(
            "{:08X}{:08X}{:08X}",
            tli,
            segno / SEGMENTS_PER_XLOG_ID,
            segno % SEGMENTS_PER_XLOG_ID
        )
    }
}

// 描述符里以 `X/X` 文本形式持久化，与服务器交换格式保持一致
impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Lsn::parse(&text).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let lsn = Lsn::parse("0/2000028").unwrap();
        assert_eq!(lsn.0, 0x2000028);
        assert_eq!(lsn.to_string(), "0/02000028");

        let lsn = Lsn::parse("A/DEADBEEF").unwrap();
        assert_eq!(lsn.0, 0xA_DEAD_BEEF);
        assert_eq!(lsn.to_string(), "A/DEADBEEF");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Lsn::parse("no-slash").is_err());
        assert!(Lsn::parse("X/Y/Z").is_err());
        assert!(Lsn::parse("G/0").is_err());
    }

    #[test]
    fn segment_file_name_matches_server_convention() {
        // 段 2（位于 0x2000000 之后）属于 xlogid 0
        let lsn = Lsn::parse("0/2000028").unwrap();
        assert_eq!(lsn.segment_file_name(1), "000000010000000000000002");

        // xlogid 进位：高 32 位为 1 时段序号跨过 256
        let lsn = Lsn(0x1_0000_0000);
        assert_eq!(lsn.segment_file_name(3), "000000030000000100000000");
    }

    #[test]
    fn lsn_ordering_is_numeric() {
        assert!(Lsn::parse("0/FF").unwrap() < Lsn::parse("1/0").unwrap());
    }
}
