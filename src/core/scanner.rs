//! 目录树扫描
//!
//! 本地和远程各自扫出一棵以相对路径为键的树快照，
//! 键统一为小写、正斜杠、以 / 开头，供差异分析做连接。

use crate::core::entry::{CalendarDate, ClockTime, EntryKind, FileEntry};
use crate::core::listing::ListingParser;
use crate::error::{BackupError, Result};
use crate::ftp::FtpSession;
use chrono::{DateTime, Datelike, Local, Months, Timelike};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 一次扫描的累计数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// 取文件名的扩展名（小写），无点号时为空
pub fn extension_of(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

/// 超过该阈值的旧文件，时分归零后再参与比较。
/// 远程侧对半年以上的文件只报日期不报时分，本地侧需对齐。
fn stale_threshold(now: DateTime<Local>) -> DateTime<Local> {
    now.checked_sub_months(Months::new(6)).unwrap_or(now)
}

fn calendar_of(mtime: SystemTime, threshold: DateTime<Local>) -> (CalendarDate, ClockTime) {
    let dt: DateTime<Local> = mtime.into();
    let date = CalendarDate {
        year: dt.year(),
        month: dt.month(),
        day: dt.day(),
    };
    let time = if dt < threshold {
        ClockTime {
            hours: 0,
            minutes: 0,
        }
    } else {
        ClockTime {
            hours: dt.hour(),
            minutes: dt.minute(),
        }
    };
    (date, time)
}

/// 本地目录树扫描器
pub struct LocalScanner {
    root: PathBuf,
    ignored_extensions: Vec<String>,
    ignored_dirs: Vec<String>,
}

impl LocalScanner {
    pub fn new(root: &str, ignored_extensions: &[String], ignored_dirs: &[String]) -> Self {
        Self {
            root: PathBuf::from(root),
            ignored_extensions: ignored_extensions.iter().map(|e| e.to_lowercase()).collect(),
            ignored_dirs: ignored_dirs.iter().map(|d| d.to_lowercase()).collect(),
        }
    }

    /// 深度优先遍历本地根目录。根目录打不开则整个扫描失败。
    pub fn scan(&self) -> Result<(BTreeMap<String, FileEntry>, ScanSummary)> {
        if !self.root.is_dir() {
            return Err(BackupError::FileSystem(format!(
                "无法打开本地目录 {}",
                self.root.display()
            )));
        }

        info!("分析本地目录 {}", self.root.display());
        let threshold = stale_threshold(Local::now());
        let mut entries: BTreeMap<String, FileEntry> = BTreeMap::new();
        let mut summary = ScanSummary::default();

        let root = self.root.clone();
        let ignored_dirs = self.ignored_dirs.clone();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| {
                if !e.file_type().is_dir() {
                    return true;
                }
                match relative_key(&root, e.path()) {
                    Some(rel) if !rel.is_empty() => {
                        let keep = !ignored_dirs.contains(&format!("{}/", rel));
                        if !keep {
                            debug!("跳过忽略目录 {}", rel);
                        }
                        keep
                    }
                    _ => true,
                }
            });

        for item in walker {
            let item =
                item.map_err(|e| BackupError::FileSystem(format!("遍历本地目录失败: {}", e)))?;
            let Some(rel) = relative_key(&self.root, item.path()) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }

            let meta = item.metadata().map_err(|e| {
                BackupError::FileSystem(format!("读取 {} 元数据失败: {}", item.path().display(), e))
            })?;
            let mtime = meta.modified().map_err(|e| {
                BackupError::FileSystem(format!("读取 {} 修改时间失败: {}", item.path().display(), e))
            })?;
            let (date, time) = calendar_of(mtime, threshold);
            let name = rel.rsplit('/').next().unwrap_or_default().to_string();

            if item.file_type().is_dir() {
                let key = format!("{}/", rel);
                entries.insert(
                    key.clone(),
                    FileEntry::new(key, name, String::new(), EntryKind::Directory, 0, date, time),
                );
            } else if item.file_type().is_file() {
                let ext = extension_of(&name);
                if self.ignored_extensions.contains(&ext) {
                    debug!("跳过忽略扩展名 {} ({})", ext, rel);
                    continue;
                }
                let mut entry = FileEntry::new(
                    rel.clone(),
                    name,
                    ext,
                    EntryKind::File,
                    meta.len(),
                    date,
                    time,
                );
                entry.local_path = Some(item.path().to_path_buf());
                summary.file_count += 1;
                summary.total_bytes += entry.size;
                entries.insert(rel, entry);
            }
        }

        info!(
            "本地分析完成: {} 个文件, {} 字节 (~{:.2} MB)",
            summary.file_count,
            summary.total_bytes,
            summary.total_bytes as f64 / 1024.0 / 1024.0
        );
        Ok((entries, summary))
    }
}

/// 根目录到某路径的相对键，小写、正斜杠、前导 /；根本身为空串
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut key = String::new();
    for comp in rel.components() {
        key.push('/');
        key.push_str(&comp.as_os_str().to_string_lossy().to_lowercase());
    }
    Some(key)
}

/// 远程扫描结果
pub struct RemoteTree {
    pub entries: BTreeMap<String, FileEntry>,
    /// 远程已存在的目录相对路径（带尾部 /），用作目录创建去重的种子
    pub existing_dirs: Vec<String>,
    pub summary: ScanSummary,
}

/// 远程目录树扫描器，通过列表请求递归下行
pub struct RemoteScanner<'a> {
    session: &'a mut dyn FtpSession,
    parser: ListingParser,
    ignored_dirs: Vec<String>,
}

impl<'a> RemoteScanner<'a> {
    pub fn new(session: &'a mut dyn FtpSession, ignored_dirs: &[String]) -> Self {
        Self {
            session,
            parser: ListingParser::new(),
            ignored_dirs: ignored_dirs.iter().map(|d| d.to_lowercase()).collect(),
        }
    }

    /// 扫描远程根目录。只支持 UNIX 方言列表，
    /// 其它系统类型视为无法解析。
    pub fn scan(&mut self, remote_root: &str) -> Result<RemoteTree> {
        let sys_type = self
            .session
            .system_type()
            .map_err(|e| BackupError::Connection(format!("获取系统类型失败: {}", e)))?;
        if !sys_type.to_uppercase().contains("UNIX") {
            return Err(BackupError::ListingParse(format!(
                "不支持的远程系统类型: {}",
                sys_type
            )));
        }

        let server_root = if remote_root.ends_with('/') {
            remote_root.to_string()
        } else {
            format!("{}/", remote_root)
        };

        info!("分析远程目录 {}", server_root);
        let mut tree = RemoteTree {
            entries: BTreeMap::new(),
            existing_dirs: vec!["/".to_string()],
            summary: ScanSummary::default(),
        };
        self.scan_dir(&server_root, "/", &mut tree)?;

        info!(
            "远程分析完成: {} 个文件, {} 字节",
            tree.summary.file_count, tree.summary.total_bytes
        );
        Ok(tree)
    }

    fn scan_dir(&mut self, server_dir: &str, rel_dir: &str, tree: &mut RemoteTree) -> Result<()> {
        debug!("获取 {} 的列表", server_dir);
        let lines = self
            .session
            .list(server_dir)
            .map_err(|e| BackupError::Connection(format!("获取 {} 列表失败: {}", server_dir, e)))?;

        for (key, record) in self.parser.parse(&lines, rel_dir)? {
            if record.is_directory() {
                let rel_sub = format!("{}/", key);
                if self.ignored_dirs.contains(&rel_sub) {
                    debug!("跳过忽略目录 {}", rel_sub);
                    continue;
                }
                let server_sub = format!("{}{}/", server_dir, record.name);
                self.scan_dir(&server_sub, &rel_sub, tree)?;
                // 扫描时已看到的目录不需要再创建
                tree.existing_dirs.push(rel_sub.clone());
                tree.entries.insert(
                    rel_sub.clone(),
                    FileEntry::new(
                        rel_sub,
                        record.name,
                        String::new(),
                        EntryKind::Directory,
                        0,
                        record.date,
                        record.time,
                    ),
                );
            } else {
                let ext = extension_of(&record.name);
                let entry = FileEntry::new(
                    key.clone(),
                    record.name,
                    ext,
                    EntryKind::File,
                    record.size,
                    record.date,
                    record.time,
                );
                tree.summary.file_count += 1;
                tree.summary.total_bytes += entry.size;
                if tree.entries.insert(key.clone(), entry).is_some() {
                    warn!("远程列表中出现重复键 {}", key);
                }
            }
        }
        Ok(())
    }
}
