//! 压缩暂存
//!
//! 上传前把标记的文件压缩到源文件同目录下的产物文件，
//! 传输阶段结束后统一删除这些产物。

use crate::core::comparator::UploadPlan;
use crate::error::{BackupError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 压缩能力，产出压缩文件并报告压缩后的字节数
pub trait Compressor {
    /// 压缩产物的扩展名，如 "gz"
    fn archive_extension(&self) -> &str;

    fn compress(&self, source: &Path, dest: &Path) -> Result<u64>;
}

/// 基于 gzip 的压缩实现
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn archive_extension(&self) -> &str {
        "gz"
    }

    fn compress(&self, source: &Path, dest: &Path) -> Result<u64> {
        let mut input = File::open(source).map_err(|e| {
            BackupError::Compression(format!("无法打开 {}: {}", source.display(), e))
        })?;
        let output = File::create(dest).map_err(|e| {
            BackupError::Compression(format!("无法创建 {}: {}", dest.display(), e))
        })?;

        let mut encoder = GzEncoder::new(output, Compression::default());
        io::copy(&mut input, &mut encoder)
            .and_then(|_| encoder.finish())
            .map_err(|e| {
                BackupError::Compression(format!("压缩 {} 失败: {}", source.display(), e))
            })?;

        let size = dest
            .metadata()
            .map_err(|e| {
                BackupError::Compression(format!("读取 {} 大小失败: {}", dest.display(), e))
            })?
            .len();
        Ok(size)
    }
}

/// 暂存结果
#[derive(Debug, Default)]
pub struct StageOutcome {
    /// 生成的本地压缩产物，运行结束后删除
    pub artifacts: Vec<PathBuf>,
    /// 压缩后的字节总量
    pub compressed_bytes: u64,
}

/// 压缩暂存器，驱动外部压缩能力处理计划中的压缩候选
pub struct CompressionStager<'a> {
    compressor: &'a dyn Compressor,
}

impl<'a> CompressionStager<'a> {
    pub fn new(compressor: &'a dyn Compressor) -> Self {
        Self { compressor }
    }

    /// 为计划中每个压缩候选生成产物。任一文件压缩失败则整个运行失败，
    /// 失败前已生成（含写了一半）的产物就地删除，不留在磁盘上。
    pub fn stage(&self, plan: &UploadPlan) -> Result<StageOutcome> {
        let mut outcome = StageOutcome::default();
        if let Err(e) = self.stage_all(plan, &mut outcome) {
            cleanup_artifacts(&outcome.artifacts);
            return Err(e);
        }

        if !outcome.artifacts.is_empty() {
            info!(
                "压缩暂存完成: {} 个产物, {} 字节",
                outcome.artifacts.len(),
                outcome.compressed_bytes
            );
        }
        Ok(outcome)
    }

    fn stage_all(&self, plan: &UploadPlan, outcome: &mut StageOutcome) -> Result<()> {
        for candidate in &plan.candidates {
            if !candidate.is_compressed() {
                continue;
            }
            let entry = candidate.entry();
            let source = entry.local_path.as_ref().ok_or_else(|| {
                BackupError::Compression(format!("{} 没有本地源路径", entry.old_path))
            })?;
            let dest = entry.archive_local_path().ok_or_else(|| {
                BackupError::Compression(format!("{} 无法确定产物路径", entry.old_path))
            })?;

            info!("压缩 {} -> {}", source.display(), dest.display());
            // 先记录产物路径，压缩中途失败的半成品也能被清理
            outcome.artifacts.push(dest.clone());
            let size = self.compressor.compress(source, &dest)?;
            debug!("{} 压缩后 {} 字节", entry.name, size);
            outcome.compressed_bytes += size;
        }
        Ok(())
    }
}

/// 删除暂存产物。删除失败只记日志，不影响运行结果。
pub fn cleanup_artifacts(artifacts: &[PathBuf]) {
    for path in artifacts {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("已删除暂存产物 {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除暂存产物 {} 失败: {}", path.display(), e),
        }
    }
}
