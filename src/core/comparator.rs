//! 差异分析
//!
//! 比较本地与远程两棵树，产出需要上传的条目集合。
//! 只信任修改时间：时间戳严格大于远程才算更新，相等不传。

use crate::core::entry::{EntryKind, FileEntry};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 传输候选，压缩与否在这里显式区分，
/// 后续阶段按标签分支而不是看被改过的字段
#[derive(Debug, Clone)]
pub enum TransferCandidate {
    /// 原样上传
    Plain(FileEntry),
    /// 先压缩再上传，条目身份已改写为压缩产物
    Compressed(FileEntry),
}

impl TransferCandidate {
    pub fn entry(&self) -> &FileEntry {
        match self {
            TransferCandidate::Plain(e) | TransferCandidate::Compressed(e) => e,
        }
    }

    pub fn entry_mut(&mut self) -> &mut FileEntry {
        match self {
            TransferCandidate::Plain(e) | TransferCandidate::Compressed(e) => e,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, TransferCandidate::Compressed(_))
    }
}

/// 一次差异分析的产出
#[derive(Debug, Default)]
pub struct UploadPlan {
    /// 按键降序排列的上传候选
    pub candidates: Vec<TransferCandidate>,
    pub file_count: u64,
    /// 选中条目的原始字节总量（压缩前）
    pub total_bytes: u64,
}

/// 差异引擎
pub struct DiffEngine {
    compress_names: Vec<String>,
    compress_extensions: Vec<String>,
    archive_ext: String,
    keep_original_extension: bool,
}

impl DiffEngine {
    pub fn new(
        compress_names: &[String],
        compress_extensions: &[String],
        archive_ext: &str,
        keep_original_extension: bool,
    ) -> Self {
        Self {
            compress_names: compress_names.iter().map(|n| n.to_lowercase()).collect(),
            compress_extensions: compress_extensions.iter().map(|e| e.to_lowercase()).collect(),
            archive_ext: archive_ext.to_string(),
            keep_original_extension,
        }
    }

    /// 计算上传集合。需要压缩的条目先改写为压缩产物身份，
    /// 再用改写后的键去远程查找，这样远程已有的压缩产物能对上。
    pub fn diff(
        &self,
        local: &BTreeMap<String, FileEntry>,
        remote: &BTreeMap<String, FileEntry>,
    ) -> UploadPlan {
        info!("分析需要上传的文件");
        let mut plan = UploadPlan::default();

        // 键降序只影响日志和上传顺序，不影响选中结果
        for (_, local_entry) in local.iter().rev() {
            if local_entry.kind == EntryKind::Directory {
                continue;
            }
            if local_entry.size == 0 {
                info!("跳过 {}: 大小为 0", local_entry.name);
                continue;
            }

            let mut entry = local_entry.clone();
            let compress = self.compress_names.contains(&entry.old_name)
                || self.compress_extensions.contains(&entry.old_ext);
            if compress {
                entry.stage_as_archive(&self.archive_ext, self.keep_original_extension);
                debug!("{} 进入压缩队列", entry.old_name);
            }

            let selected = match remote.get(&entry.path) {
                None => {
                    debug!("新文件 - {} - {} 字节", entry.path, entry.size);
                    true
                }
                Some(remote_entry) => {
                    if entry.timestamp > remote_entry.timestamp {
                        debug!(
                            "已更新 - {} - 本地 {} > 远程 {}",
                            entry.path, entry.timestamp, remote_entry.timestamp
                        );
                        entry.in_remote = true;
                        true
                    } else {
                        false
                    }
                }
            };

            if selected {
                plan.file_count += 1;
                plan.total_bytes += entry.size;
                plan.candidates.push(if compress {
                    TransferCandidate::Compressed(entry)
                } else {
                    TransferCandidate::Plain(entry)
                });
            }
        }

        info!(
            "差异分析完成: {} 个文件待上传, {} 字节 (~{:.2} MB)",
            plan.file_count,
            plan.total_bytes,
            plan.total_bytes as f64 / 1024.0 / 1024.0
        );
        plan
    }
}
