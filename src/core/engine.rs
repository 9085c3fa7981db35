//! 备份引擎
//!
//! 按固定顺序驱动一次完整运行：
//! 本地扫描 → 远程扫描 → 差异分析 → 压缩暂存 → 传输 → 清理。
//! 任一阶段失败即跳过后续阶段，但暂存产物清理总会执行。

use crate::config::BackupConfig;
use crate::core::comparator::DiffEngine;
use crate::core::compress::{cleanup_artifacts, CompressionStager, Compressor};
use crate::core::scanner::{LocalScanner, RemoteScanner};
use crate::core::transfer::TransferSession;
use crate::error::{BackupError, Result};
use crate::ftp::FtpDialer;
use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, warn};

/// 一次运行的汇总报告，失败的运行也会产出
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub success: bool,
    pub duration_secs: f64,
    /// 运行中止时的汇总错误信息
    pub last_error: Option<String>,
    pub local_files: u64,
    pub local_bytes: u64,
    pub remote_files: u64,
    pub remote_bytes: u64,
    pub selected_files: u64,
    pub selected_bytes: u64,
    pub compressed_bytes: u64,
    pub uploaded_files: u64,
    pub uploaded_bytes: u64,
    pub reconcile_failures: u64,
    pub preview_only: bool,
}

/// 备份引擎，持有一次运行的全部协作方
pub struct BackupEngine<'a> {
    config: &'a BackupConfig,
    dialer: &'a dyn FtpDialer,
    compressor: &'a dyn Compressor,
}

impl<'a> BackupEngine<'a> {
    pub fn new(
        config: &'a BackupConfig,
        dialer: &'a dyn FtpDialer,
        compressor: &'a dyn Compressor,
    ) -> Self {
        Self {
            config,
            dialer,
            compressor,
        }
    }

    /// 执行一次备份并返回报告。阶段失败不 panic 也不丢报告，
    /// 错误信息汇总进 `last_error`。
    pub fn run(&self) -> BackupReport {
        let started = Instant::now();
        let mut report = BackupReport {
            preview_only: self.config.preview_only,
            ..Default::default()
        };

        match self.execute(&mut report) {
            Ok(()) => {
                report.success = true;
                info!("备份运行完成");
            }
            Err(e) => {
                error!("备份失败: {}", e);
                report.last_error = Some(e.to_string());
            }
        }
        report.duration_secs = started.elapsed().as_secs_f64();
        report
    }

    /// 远程扫描和传输各自使用独立的会话，先后建立，绝不并用
    fn execute(&self, report: &mut BackupReport) -> Result<()> {
        let scanner = LocalScanner::new(
            &self.config.local_root,
            &self.config.ignored_extensions,
            &self.config.ignored_dirs,
        );
        let (local_entries, local_summary) = scanner.scan()?;
        report.local_files = local_summary.file_count;
        report.local_bytes = local_summary.total_bytes;
        if local_summary.file_count == 0 {
            return Err(BackupError::FileSystem(
                "本地目录没有可备份的文件".to_string(),
            ));
        }

        let remote_tree = self.scan_remote()?;
        report.remote_files = remote_tree.summary.file_count;
        report.remote_bytes = remote_tree.summary.total_bytes;

        let diff = DiffEngine::new(
            &self.config.compress_names,
            &self.config.compress_extensions,
            self.compressor.archive_extension(),
            self.config.keep_original_extension,
        );
        let plan = diff.diff(&local_entries, &remote_tree.entries);
        report.selected_files = plan.file_count;
        report.selected_bytes = plan.total_bytes;

        if self.config.preview_only {
            info!("预览模式，跳过压缩与上传");
            return Ok(());
        }
        if plan.file_count == 0 {
            info!("没有需要上传的文件");
            return Ok(());
        }

        let staged = CompressionStager::new(self.compressor).stage(&plan)?;
        report.compressed_bytes = staged.compressed_bytes;

        // 无论传输成败，暂存产物都要删除
        let transfer_result = TransferSession::new(self.dialer, self.config)
            .run(&plan, &remote_tree.existing_dirs);
        cleanup_artifacts(&staged.artifacts);
        let outcome = transfer_result?;

        report.uploaded_files = outcome.uploaded_files;
        report.uploaded_bytes = outcome.uploaded_bytes;
        report.reconcile_failures = outcome.reconcile_failures;
        if report.reconcile_failures > 0 {
            warn!("{} 个文件的时间戳校正失败", report.reconcile_failures);
        }
        Ok(())
    }

    /// 远程扫描阶段：建立专用会话，扫描完成后立即关闭
    fn scan_remote(&self) -> Result<crate::core::scanner::RemoteTree> {
        let session = self.dialer.dial(&self.config.server).map_err(|e| {
            BackupError::Connection(format!("连接 {} 失败: {}", self.config.server.host, e))
        })?;
        let mut session = scopeguard::guard(session, |mut s| {
            if let Err(e) = s.quit() {
                warn!("关闭扫描会话失败: {}", e);
            }
        });

        session
            .login(&self.config.server.username, &self.config.server.password)
            .map_err(|e| BackupError::Authentication(format!("登录被拒绝: {}", e)))?;
        if self.config.server.use_passive {
            if let Err(e) = session.set_passive(true) {
                warn!("设置被动模式失败: {}", e);
            }
        }

        let mut scanner = RemoteScanner::new(session.as_mut(), &self.config.ignored_dirs);
        scanner.scan(&self.config.remote_root)
    }
}
