//! 虚拟文件条目
//!
//! 描述一个本地或远程的文件/目录，与其物理存储解耦。
//! 相对路径（正斜杠、小写、以 / 开头）是两棵树之间的连接键。

use chrono::{Local, NaiveDate, TimeZone};
use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// 修改日期（不含时分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalendarDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

/// 修改时间，秒不参与比较，始终为零
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockTime {
    pub hours: u32,
    pub minutes: u32,
}

/// 由日历值推导绝对时间戳（本地时区，秒为零）
pub fn derive_timestamp(date: CalendarDate, time: ClockTime) -> i64 {
    let naive = NaiveDate::from_ymd_opt(date.year, date.month, date.day)
        .and_then(|d| d.and_hms_opt(time.hours, time.minutes, 0));

    let Some(naive) = naive else {
        warn!(
            "无效的日历值: {}-{}-{} {}:{}",
            date.year, date.month, date.day, time.hours, time.minutes
        );
        return 0;
    };

    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.timestamp(),
        // 夏令时跳变导致本地时间不存在时退回 UTC
        None => naive.and_utc().timestamp(),
    }
}

/// 虚拟文件条目
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// 相对路径键，如 /docs/report.txt
    pub path: String,
    /// 文件名
    pub name: String,
    /// 扩展名（小写，无扩展名时为空）
    pub ext: String,
    /// 条目类型
    pub kind: EntryKind,
    /// 字节大小
    pub size: u64,
    /// 修改日期
    pub date: CalendarDate,
    /// 修改时间
    pub time: ClockTime,
    /// 由日历值推导的绝对时间戳
    pub timestamp: i64,
    /// 远程是否已有同键文件（差异分析时标记）
    pub in_remote: bool,
    /// 是否已改写为压缩产物身份
    pub staged: bool,
    /// 改写前的相对路径
    pub old_path: String,
    /// 改写前的文件名
    pub old_name: String,
    /// 改写前的扩展名
    pub old_ext: String,
    /// 本地源文件的绝对路径（仅本地条目）
    pub local_path: Option<PathBuf>,
}

impl FileEntry {
    /// 构造一个文件条目，改写前身份与当前身份一致
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: String,
        name: String,
        ext: String,
        kind: EntryKind,
        size: u64,
        date: CalendarDate,
        time: ClockTime,
    ) -> Self {
        let timestamp = derive_timestamp(date, time);
        Self {
            old_path: path.clone(),
            old_name: name.clone(),
            old_ext: ext.clone(),
            path,
            name,
            ext,
            kind,
            size,
            date,
            time,
            timestamp,
            in_remote: false,
            staged: false,
            local_path: None,
        }
    }

    /// 把虚拟身份改写为压缩产物，原身份保留在 old_* 中。
    /// 后续阶段（差异匹配、上传、清理）只看改写后的名字。
    pub fn stage_as_archive(&mut self, archive_ext: &str, keep_old_ext: bool) {
        if self.staged {
            return;
        }
        self.old_path = self.path.clone();
        self.old_name = self.name.clone();
        self.old_ext = self.ext.clone();

        let new_name = if keep_old_ext || self.ext.is_empty() {
            format!("{}.{}", self.name, archive_ext)
        } else {
            let stem = self
                .name
                .strip_suffix(&format!(".{}", self.ext))
                .unwrap_or(&self.name);
            format!("{}.{}", stem, archive_ext)
        };

        let parent = match self.path.rfind('/') {
            Some(pos) => &self.path[..=pos],
            None => "",
        };
        self.path = format!("{}{}", parent, new_name);
        self.name = new_name;
        self.ext = archive_ext.to_string();
        self.staged = true;
    }

    /// 压缩产物在本地的落盘路径（源文件同目录，改写后的名字）
    pub fn archive_local_path(&self) -> Option<PathBuf> {
        let source = self.local_path.as_ref()?;
        Some(source.parent()?.join(&self.name))
    }
}
