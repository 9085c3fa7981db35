//! 传输阶段
//!
//! 协议会话状态机：连接、认证、设置模式、补建目录、
//! 逐个上传、校正远程时间戳、无条件关闭连接。
//! 上传失败立即中止整个运行，时间戳校正失败只记录。

use crate::config::BackupConfig;
use crate::core::comparator::{TransferCandidate, UploadPlan};
use crate::core::entry::FileEntry;
use crate::core::scanner::extension_of;
use crate::error::{BackupError, Result};
use crate::ftp::{FtpDialer, FtpSession, PutStatus, TransferMode};
use chrono::{DateTime, Local, Offset};
use std::collections::HashSet;
use std::fs::File;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 会话所处阶段，用于错误日志定位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    ModeSet,
    Transferring,
    Closed,
    Failed,
}

/// 已知存在的远程目录集合，避免重复发 MKD
pub struct DirectoryCreationTracker {
    known: HashSet<String>,
}

impl DirectoryCreationTracker {
    /// 种子为远程扫描时看到的目录（带尾部 /）
    pub fn new(existing_dirs: &[String]) -> Self {
        let mut known: HashSet<String> = existing_dirs.iter().cloned().collect();
        known.insert("/".to_string());
        Self { known }
    }

    /// 保证文件路径的所有祖先目录存在，按根到叶逐级补建。
    /// 无论建立成败，前缀都会记入已知集合；建目录失败对整个运行是致命的。
    pub fn ensure_path(&mut self, session: &mut dyn FtpSession, file_path: &str) -> Result<()> {
        let Some(last_slash) = file_path[1..].rfind('/') else {
            return Ok(()); // 根目录下的文件
        };
        let parent = &file_path[..last_slash + 2]; // 带尾部 /
        if self.known.contains(parent) {
            return Ok(());
        }

        let mut prefix = String::from("/");
        for component in file_path[1..last_slash + 1].split('/') {
            prefix.push_str(component);
            prefix.push('/');
            if self.known.contains(&prefix) {
                continue;
            }
            info!("创建目录 {}", prefix);
            // 相对当前工作目录（远程根）发送
            let result = session.make_dir(&prefix[1..]);
            self.known.insert(prefix.clone());
            result.map_err(|e| {
                BackupError::DirectoryCreate(format!("创建目录 {} 失败: {}", prefix, e))
            })?;
        }
        Ok(())
    }
}

/// 传输结果
#[derive(Debug, Default)]
pub struct TransferOutcome {
    pub uploaded_files: u64,
    pub uploaded_bytes: u64,
    /// 时间戳校正失败次数（非致命）
    pub reconcile_failures: u64,
}

/// 传输会话，驱动一次完整的上传阶段
pub struct TransferSession<'a> {
    dialer: &'a dyn FtpDialer,
    config: &'a BackupConfig,
}

impl<'a> TransferSession<'a> {
    pub fn new(dialer: &'a dyn FtpDialer, config: &'a BackupConfig) -> Self {
        Self { dialer, config }
    }

    /// 执行上传阶段。连接在所有退出路径上都会被关闭。
    pub fn run(&self, plan: &UploadPlan, existing_dirs: &[String]) -> Result<TransferOutcome> {
        let mut state = SessionState::Disconnected;

        let result = (|| {
            state = SessionState::Connecting;
            let session = self.dialer.dial(&self.config.server).map_err(|e| {
                BackupError::Connection(format!("连接 {} 失败: {}", self.config.server.host, e))
            })?;
            let mut session = scopeguard::guard(session, |mut s| {
                if let Err(e) = s.quit() {
                    warn!("关闭连接失败: {}", e);
                }
            });
            self.run_phases(session.as_mut(), plan, existing_dirs, &mut state)
        })();

        match &result {
            Ok(_) => {
                state = SessionState::Closed;
                debug!("会话状态: {:?}", state);
            }
            Err(e) => {
                warn!("传输会话在 {:?} 阶段失败: {}", state, e);
                state = SessionState::Failed;
                debug!("会话状态: {:?}", state);
            }
        }
        result
    }

    fn run_phases(
        &self,
        session: &mut dyn FtpSession,
        plan: &UploadPlan,
        existing_dirs: &[String],
        state: &mut SessionState,
    ) -> Result<TransferOutcome> {
        session
            .login(&self.config.server.username, &self.config.server.password)
            .map_err(|e| BackupError::Authentication(format!("登录被拒绝: {}", e)))?;
        *state = SessionState::Authenticated;

        // 被动模式尽力而为，失败不中止会话
        if self.config.server.use_passive {
            if let Err(e) = session.set_passive(true) {
                warn!("设置被动模式失败: {}", e);
            }
        }
        *state = SessionState::ModeSet;

        session.change_dir(&self.config.remote_root).map_err(|e| {
            BackupError::Connection(format!(
                "无法进入远程目录 {}: {}",
                self.config.remote_root, e
            ))
        })?;

        *state = SessionState::Transferring;
        let mut tracker = DirectoryCreationTracker::new(existing_dirs);
        let mut outcome = TransferOutcome::default();

        for candidate in &plan.candidates {
            self.upload_one(session, candidate, &mut tracker, &mut outcome)?;
        }

        info!(
            "上传完成: {} 个文件, {} 字节",
            outcome.uploaded_files, outcome.uploaded_bytes
        );
        Ok(outcome)
    }

    fn upload_one(
        &self,
        session: &mut dyn FtpSession,
        candidate: &TransferCandidate,
        tracker: &mut DirectoryCreationTracker,
        outcome: &mut TransferOutcome,
    ) -> Result<()> {
        let entry = candidate.entry();
        tracker.ensure_path(session, &entry.path)?;

        let original_path = entry.path[1..].to_string();
        let renamed = entry.in_remote && !self.config.overwrite_remote;
        let remote_path = if renamed {
            conflict_renamed_path(&original_path, Local::now())
        } else {
            original_path.clone()
        };

        let local_path = match candidate {
            TransferCandidate::Plain(e) => e.local_path.clone(),
            TransferCandidate::Compressed(e) => e.archive_local_path(),
        }
        .ok_or_else(|| BackupError::FileSystem(format!("{} 没有本地源路径", entry.path)))?;

        let source = File::open(&local_path).map_err(|e| {
            BackupError::FileSystem(format!("无法打开 {}: {}", local_path.display(), e))
        })?;

        let mode = if self.config.ascii_extensions.contains(&extension_of(&entry.name)) {
            TransferMode::Ascii
        } else {
            TransferMode::Binary
        };

        info!(
            "以 {} 模式上传 {} ({} 字节)",
            mode.as_str(),
            entry.name,
            entry.size
        );
        let started = Instant::now();

        let mut status = session
            .put_nonblocking(&remote_path, Box::new(source), mode)
            .map_err(|e| BackupError::Transfer(format!("上传 {} 失败: {}", entry.name, e)))?;
        while status == PutStatus::MoreData {
            status = session
                .put_continue()
                .map_err(|e| BackupError::Transfer(format!("上传 {} 失败: {}", entry.name, e)))?;
        }

        info!("上传完成，耗时 {:.4}s", started.elapsed().as_secs_f64());
        outcome.uploaded_files += 1;
        outcome.uploaded_bytes += entry.size;

        if !self.reconcile_timestamp(session, entry, &remote_path) {
            outcome.reconcile_failures += 1;
        }
        // 改名上传后，同时校正原路径上历史文件的时间戳，
        // 标记本地更新已经有了副本
        if renamed && !self.reconcile_timestamp(session, entry, &original_path) {
            outcome.reconcile_failures += 1;
        }
        Ok(())
    }

    /// 用 MDTM 原始命令把远程文件时间设为条目的日历时间。
    /// 失败记录完整诊断但不中止运行。
    fn reconcile_timestamp(
        &self,
        session: &mut dyn FtpSession,
        entry: &FileEntry,
        remote_path: &str,
    ) -> bool {
        let command = mdtm_command(entry, remote_path, Local::now());
        match session.raw(&command) {
            Ok(reply) if reply.starts_with("253") => {
                debug!("{} - ok", command);
                true
            }
            Ok(reply) => {
                warn!(
                    "MDTM 命令失败! 命令: {} 日历值: {}-{}-{} {}:{} 响应: {}",
                    command,
                    entry.date.year,
                    entry.date.month,
                    entry.date.day,
                    entry.time.hours,
                    entry.time.minutes,
                    reply
                );
                false
            }
            Err(e) => {
                warn!("MDTM 命令发送失败: {} ({})", command, e);
                false
            }
        }
    }
}

/// 覆盖关闭时的冲突改名：在扩展名前插入传输时刻
fn conflict_renamed_path(remote_path: &str, now: DateTime<Local>) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    match remote_path.rsplit_once('.') {
        Some((stem, ext)) => format!("{}_{}.{}", stem, stamp, ext),
        None => format!("{}_{}", remote_path, stamp),
    }
}

/// 组装 MDTM 命令：YYYYMMDDHHMMSS + 客户端时区偏移分钟数
fn mdtm_command(entry: &FileEntry, remote_path: &str, now: DateTime<Local>) -> String {
    let tz_minutes = now.offset().fix().local_minus_utc() / 60;
    format!(
        "MDTM {}{:02}{:02}{:02}{:02}00{} {}",
        entry.date.year,
        entry.date.month,
        entry.date.day,
        entry.time.hours,
        entry.time.minutes,
        tz_minutes,
        remote_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogConfig, ServerConfig};
    use crate::core::entry::{CalendarDate, ClockTime, EntryKind};
    use crate::ftp::testing::{MockDialer, MockState};
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;

    fn config() -> BackupConfig {
        BackupConfig {
            server: ServerConfig {
                host: "ftp.example.com".to_string(),
                port: 21,
                timeout_secs: 10,
                username: "u".to_string(),
                password: "p".to_string(),
                use_secure: false,
                use_passive: false,
            },
            local_root: String::new(),
            remote_root: "/backup/".to_string(),
            ignored_extensions: vec![],
            ignored_dirs: vec![],
            ascii_extensions: vec!["txt".to_string()],
            compress_names: vec![],
            compress_extensions: vec![],
            keep_original_extension: true,
            overwrite_remote: true,
            preview_only: false,
            verbose: false,
            log: LogConfig::default(),
        }
    }

    fn candidate(dir: &Path, rel: &str, content: &[u8], in_remote: bool) -> TransferCandidate {
        let name = rel.rsplit('/').next().unwrap().to_string();
        let local = dir.join(&name);
        fs::write(&local, content).unwrap();
        let mut entry = FileEntry::new(
            rel.to_string(),
            name.clone(),
            extension_of(&name),
            EntryKind::File,
            content.len() as u64,
            CalendarDate {
                year: 2024,
                month: 1,
                day: 1,
            },
            ClockTime {
                hours: 12,
                minutes: 0,
            },
        );
        entry.in_remote = in_remote;
        entry.local_path = Some(local);
        TransferCandidate::Plain(entry)
    }

    fn plan_of(candidates: Vec<TransferCandidate>) -> UploadPlan {
        let file_count = candidates.len() as u64;
        let total_bytes = candidates.iter().map(|c| c.entry().size).sum();
        UploadPlan {
            candidates,
            file_count,
            total_bytes,
        }
    }

    #[test]
    fn test_single_new_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![candidate(dir.path(), "/a.txt", &[b'x'; 100], false)]);
        let dialer = MockDialer::new(MockState::default());
        let config = config();

        let outcome = TransferSession::new(&dialer, &config)
            .run(&plan, &["/".to_string()])
            .unwrap();

        assert_eq!(outcome.uploaded_files, 1);
        assert_eq!(outcome.uploaded_bytes, 100);
        assert_eq!(outcome.reconcile_failures, 0);

        let state = dialer.state.borrow();
        assert_eq!(state.uploads.len(), 1);
        assert_eq!(state.uploads[0].0, "a.txt");
        assert_eq!(state.uploads[0].1, "ASCII");
        assert_eq!(state.uploads[0].2, 100);
        let mkd_count = state.commands.iter().filter(|c| c.starts_with("MKD")).count();
        assert_eq!(mkd_count, 0);
        let mdtm_count = state.commands.iter().filter(|c| c.starts_with("MDTM")).count();
        assert_eq!(mdtm_count, 1);
        assert!(state.commands.contains(&"QUIT".to_string()));
    }

    #[test]
    fn test_one_mkd_per_unique_directory() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![
            candidate(dir.path(), "/sub/deep/a.txt", b"a", false),
            candidate(dir.path(), "/sub/deep/b.txt", b"b", false),
            candidate(dir.path(), "/sub/c.txt", b"c", false),
        ]);
        let dialer = MockDialer::new(MockState::default());
        let config = config();

        TransferSession::new(&dialer, &config)
            .run(&plan, &["/".to_string()])
            .unwrap();

        let state = dialer.state.borrow();
        let mkds: Vec<&String> = state.commands.iter().filter(|c| c.starts_with("MKD")).collect();
        assert_eq!(mkds, vec!["MKD sub/", "MKD sub/deep/"]);
    }

    #[test]
    fn test_seeded_directories_are_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![candidate(dir.path(), "/sub/a.txt", b"a", false)]);
        let dialer = MockDialer::new(MockState::default());
        let config = config();

        TransferSession::new(&dialer, &config)
            .run(&plan, &["/".to_string(), "/sub/".to_string()])
            .unwrap();

        let state = dialer.state.borrow();
        assert!(!state.commands.iter().any(|c| c.starts_with("MKD")));
    }

    #[test]
    fn test_rename_on_conflict_reconciles_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![candidate(dir.path(), "/report.txt", b"data", true)]);
        let dialer = MockDialer::new(MockState::default());
        let mut config = config();
        config.overwrite_remote = false;

        let outcome = TransferSession::new(&dialer, &config)
            .run(&plan, &["/".to_string()])
            .unwrap();
        assert_eq!(outcome.reconcile_failures, 0);

        let state = dialer.state.borrow();
        let stored = &state.uploads[0].0;
        let re = regex::Regex::new(r"^report_\d{8}_\d{6}\.txt$").unwrap();
        assert!(re.is_match(stored), "unexpected path: {}", stored);

        let mdtms: Vec<&String> = state.commands.iter().filter(|c| c.starts_with("MDTM")).collect();
        assert_eq!(mdtms.len(), 2);
        assert!(mdtms[0].contains(stored.as_str()));
        assert!(mdtms[1].ends_with("report.txt"));
    }

    #[test]
    fn test_binary_mode_for_unlisted_extension() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![candidate(dir.path(), "/data.bin", b"1234", false)]);
        let dialer = MockDialer::new(MockState::default());
        let config = config();

        TransferSession::new(&dialer, &config)
            .run(&plan, &["/".to_string()])
            .unwrap();
        assert_eq!(dialer.state.borrow().uploads[0].1, "BINARY");
    }

    #[test]
    fn test_upload_failure_aborts_and_still_quits() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![
            candidate(dir.path(), "/a.txt", b"a", false),
            candidate(dir.path(), "/b.txt", b"b", false),
        ]);
        let state = MockState {
            stor_fail_on: Some("b.txt".to_string()),
            ..Default::default()
        };
        let dialer = MockDialer::new(state);
        let config = config();

        let result = TransferSession::new(&dialer, &config).run(&plan, &["/".to_string()]);
        assert!(matches!(result, Err(BackupError::Transfer(_))));

        let state = dialer.state.borrow();
        // b 在 a 之前按计划顺序失败前，a 不会被回滚
        assert!(state.commands.contains(&"QUIT".to_string()));
    }

    #[test]
    fn test_mkd_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![candidate(dir.path(), "/sub/a.txt", b"a", false)]);
        let state = MockState {
            mkd_fail_on: Some("sub/".to_string()),
            ..Default::default()
        };
        let dialer = MockDialer::new(state);
        let config = config();

        let result = TransferSession::new(&dialer, &config).run(&plan, &["/".to_string()]);
        assert!(matches!(result, Err(BackupError::DirectoryCreate(_))));
    }

    #[test]
    fn test_login_failure_is_authentication_error() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![candidate(dir.path(), "/a.txt", b"a", false)]);
        let state = MockState {
            login_fail: true,
            ..Default::default()
        };
        let dialer = MockDialer::new(state);
        let config = config();

        let result = TransferSession::new(&dialer, &config).run(&plan, &["/".to_string()]);
        assert!(matches!(result, Err(BackupError::Authentication(_))));
        assert!(dialer.state.borrow().commands.contains(&"QUIT".to_string()));
    }

    #[test]
    fn test_reconcile_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_of(vec![
            candidate(dir.path(), "/a.txt", b"a", false),
            candidate(dir.path(), "/b.txt", b"b", false),
        ]);
        let state = MockState {
            mdtm_reply: Some("550 Not allowed.".to_string()),
            ..Default::default()
        };
        let dialer = MockDialer::new(state);
        let config = config();

        let outcome = TransferSession::new(&dialer, &config)
            .run(&plan, &["/".to_string()])
            .unwrap();
        assert_eq!(outcome.uploaded_files, 2);
        assert_eq!(outcome.reconcile_failures, 2);
    }

    #[test]
    fn test_mdtm_command_format() {
        let entry = FileEntry::new(
            "/a.txt".to_string(),
            "a.txt".to_string(),
            "txt".to_string(),
            EntryKind::File,
            1,
            CalendarDate {
                year: 2024,
                month: 3,
                day: 5,
            },
            ClockTime {
                hours: 9,
                minutes: 7,
            },
        );
        let now = Local::now();
        let tz_minutes = now.offset().fix().local_minus_utc() / 60;
        let command = mdtm_command(&entry, "a.txt", now);
        assert_eq!(command, format!("MDTM 20240305090700{} a.txt", tz_minutes));
    }

    #[test]
    fn test_conflict_renamed_path_shape() {
        let now = Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            conflict_renamed_path("sub/report.txt", now),
            "sub/report_20240101_120000.txt"
        );
        assert_eq!(
            conflict_renamed_path("noext", now),
            "noext_20240101_120000"
        );
    }
}
