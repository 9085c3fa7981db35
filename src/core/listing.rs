//! 远程目录列表解析
//!
//! 解析 UNIX 长格式列表行：
//! `permissions children owner group size month day time-or-year name`
//! 文件名可以包含空格，取第九个字段之后的全部内容。

use crate::core::entry::{derive_timestamp, CalendarDate, ClockTime};
use crate::error::{BackupError, Result};
use chrono::{Datelike, Local};
use regex::Regex;
use tracing::debug;

/// 条目权限，owner/group/other 各三个字符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionTriple {
    pub owner: String,
    pub group: String,
    pub other: String,
}

/// 列表行解析出的结构化记录
#[derive(Debug, Clone)]
pub struct ListingRecord {
    /// 文件名（小写）
    pub name: String,
    /// 类型字符: '-' 文件，'d' 目录
    pub kind: char,
    pub permissions: PermissionTriple,
    pub children: u32,
    pub owner: String,
    pub group: String,
    pub size: u64,
    pub date: CalendarDate,
    pub time: ClockTime,
    pub timestamp: i64,
}

impl ListingRecord {
    pub fn is_directory(&self) -> bool {
        self.kind == 'd'
    }
}

/// UNIX 长格式列表解析器
pub struct ListingParser {
    line_re: Regex,
}

impl Default for ListingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingParser {
    pub fn new() -> Self {
        // 前八个字段以空白分隔，第九个字段为剩余全部（名字可含空格）
        let line_re = Regex::new(
            r"^(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+) (.*)$",
        )
        .unwrap();
        Self { line_re }
    }

    /// 解析一批列表行，键为 parent_dir + name。
    /// 汇总行、`.`/`..` 和链接等不支持的类型会被丢弃，
    /// 字段数不符的行视为方言不支持，整批解析失败。
    pub fn parse(&self, lines: &[String], parent_dir: &str) -> Result<Vec<(String, ListingRecord)>> {
        let parent = if parent_dir.ends_with('/') {
            parent_dir.to_string()
        } else {
            format!("{}/", parent_dir)
        };

        let mut records = Vec::new();
        for line in lines {
            if let Some(record) = self.parse_line(line)? {
                let key = format!("{}{}", parent, record.name);
                records.push((key, record));
            }
        }
        Ok(records)
    }

    /// 解析单行，返回 None 表示该行被有意丢弃
    pub fn parse_line(&self, line: &str) -> Result<Option<ListingRecord>> {
        if line.to_lowercase().starts_with("total") {
            return Ok(None);
        }

        let caps = self
            .line_re
            .captures(line)
            .ok_or_else(|| BackupError::ListingParse(format!("无法识别的列表行: {}", line)))?;

        let permissions = &caps[1];
        let name = caps[9].to_lowercase();

        let kind = permissions
            .chars()
            .next()
            .ok_or_else(|| BackupError::ListingParse(format!("权限字段为空: {}", line)))?;

        // 只处理文件和目录，链接等其它类型丢弃
        if kind != '-' && kind != 'd' {
            debug!("跳过不支持的条目类型 '{}': {}", kind, line);
            return Ok(None);
        }
        if name == "." || name == ".." {
            return Ok(None);
        }
        // 后面按字节位切三元组，非 ASCII 的权限字段直接拒绝
        if permissions.len() < 10 || !permissions.is_ascii() {
            return Err(BackupError::ListingParse(format!(
                "权限字段无效: {}",
                line
            )));
        }

        let children: u32 = caps[2]
            .parse()
            .map_err(|_| BackupError::ListingParse(format!("子项计数无效: {}", line)))?;
        let size: u64 = caps[5]
            .parse()
            .map_err(|_| BackupError::ListingParse(format!("大小字段无效: {}", line)))?;
        let month = month_number(&caps[6])
            .ok_or_else(|| BackupError::ListingParse(format!("月份无效: {}", line)))?;
        let day: u32 = caps[7]
            .parse()
            .map_err(|_| BackupError::ListingParse(format!("日期字段无效: {}", line)))?;

        // 第八个字段带冒号是当天时间（年份取当前年），否则是年份
        let time_or_year = &caps[8];
        let (date, time) = if let Some((h, m)) = time_or_year.split_once(':') {
            let hours: u32 = h
                .parse()
                .map_err(|_| BackupError::ListingParse(format!("小时字段无效: {}", line)))?;
            let minutes: u32 = m
                .parse()
                .map_err(|_| BackupError::ListingParse(format!("分钟字段无效: {}", line)))?;
            (
                CalendarDate {
                    year: Local::now().year(),
                    month,
                    day,
                },
                ClockTime { hours, minutes },
            )
        } else {
            let year: i32 = time_or_year
                .parse()
                .map_err(|_| BackupError::ListingParse(format!("年份字段无效: {}", line)))?;
            (
                CalendarDate { year, month, day },
                ClockTime {
                    hours: 0,
                    minutes: 0,
                },
            )
        };

        let timestamp = derive_timestamp(date, time);

        Ok(Some(ListingRecord {
            name,
            kind,
            permissions: PermissionTriple {
                owner: permissions[1..4].to_string(),
                group: permissions[4..7].to_string(),
                other: permissions[7..10].to_string(),
            },
            children,
            owner: caps[3].to_string(),
            group: caps[4].to_string(),
            size,
            date,
            time,
            timestamp,
        }))
    }
}

fn month_number(name: &str) -> Option<u32> {
    match name {
        "Jan" => Some(1),
        "Feb" => Some(2),
        "Mar" => Some(3),
        "Apr" => Some(4),
        "May" => Some(5),
        "Jun" => Some(6),
        "Jul" => Some(7),
        "Aug" => Some(8),
        "Sep" => Some(9),
        "Oct" => Some(10),
        "Nov" => Some(11),
        "Dec" => Some(12),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_with_year() {
        let parser = ListingParser::new();
        let record = parser
            .parse_line("-rwxr-xr-x 1 owner group 1024 Jan 15 2023 report.txt")
            .unwrap()
            .unwrap();
        assert_eq!(record.kind, '-');
        assert_eq!(record.size, 1024);
        assert_eq!(record.name, "report.txt");
        assert_eq!(
            record.date,
            CalendarDate {
                year: 2023,
                month: 1,
                day: 15
            }
        );
        assert_eq!(
            record.time,
            ClockTime {
                hours: 0,
                minutes: 0
            }
        );
        assert_eq!(record.permissions.owner, "rwx");
        assert_eq!(record.permissions.group, "r-x");
        assert_eq!(record.permissions.other, "r-x");
    }

    #[test]
    fn test_parse_line_with_time_of_day() {
        let parser = ListingParser::new();
        let record = parser
            .parse_line("-rwxr-xr-x 1 owner group 2048 Jan 15 10:30 report.txt")
            .unwrap()
            .unwrap();
        assert_eq!(record.size, 2048);
        assert_eq!(
            record.time,
            ClockTime {
                hours: 10,
                minutes: 30
            }
        );
        assert_eq!(record.date.year, Local::now().year());
        assert_eq!(record.date.month, 1);
        assert_eq!(record.date.day, 15);
    }

    #[test]
    fn test_parse_directory_and_name_with_spaces() {
        let parser = ListingParser::new();
        let record = parser
            .parse_line("drwxr-xr-x 3 owner group 4096 Mar 2 2022 My Documents")
            .unwrap()
            .unwrap();
        assert!(record.is_directory());
        assert_eq!(record.name, "my documents");
    }

    #[test]
    fn test_discards_total_dots_and_links() {
        let parser = ListingParser::new();
        assert!(parser.parse_line("total 42").unwrap().is_none());
        assert!(parser
            .parse_line("drwxr-xr-x 2 owner group 4096 Jan 1 2023 .")
            .unwrap()
            .is_none());
        assert!(parser
            .parse_line("drwxr-xr-x 2 owner group 4096 Jan 1 2023 ..")
            .unwrap()
            .is_none());
        assert!(parser
            .parse_line("lrwxrwxrwx 1 owner group 11 Jan 1 2023 link -> target")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let parser = ListingParser::new();
        assert!(parser.parse_line("garbage").is_err());
        assert!(parser
            .parse_line("-rwxr-xr-x 1 owner group notanumber Jan 15 2023 x.txt")
            .is_err());
    }

    #[test]
    fn test_non_ascii_permissions_rejected_without_panic() {
        let parser = ListingParser::new();
        let result = parser.parse_line("-rwxr-xr♥x 1 owner group 1024 Jan 15 2023 x.txt");
        assert!(matches!(result, Err(BackupError::ListingParse(_))));
    }

    #[test]
    fn test_parse_keys_by_parent_path() {
        let parser = ListingParser::new();
        let lines = vec![
            "total 8".to_string(),
            "-rw-r--r-- 1 owner group 100 Feb 3 2021 a.txt".to_string(),
            "drwxr-xr-x 2 owner group 4096 Feb 3 2021 sub".to_string(),
        ];
        let records = parser.parse(&lines, "/docs").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "/docs/a.txt");
        assert_eq!(records[1].0, "/docs/sub");
    }
}
