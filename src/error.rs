//! 错误类型定义
//!
//! 除时间戳校正（非致命，由 TransferSession 记录）外，
//! 所有错误都会使整个备份运行失败。

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

/// 备份运行中的致命错误分类
#[derive(Debug, Error)]
pub enum BackupError {
    /// 无法建立或维持 FTP 连接
    #[error("连接失败: {0}")]
    Connection(String),

    /// 认证被服务器拒绝
    #[error("认证失败: {0}")]
    Authentication(String),

    /// 远程目录列表无法解析（格式错误或不支持的方言）
    #[error("列表解析失败: {0}")]
    ListingParse(String),

    /// 本地文件系统操作失败（打开/读取/stat）
    #[error("文件系统错误: {0}")]
    FileSystem(String),

    /// 远程目录创建失败
    #[error("目录创建失败: {0}")]
    DirectoryCreate(String),

    /// 数据传输不完整或被服务器拒绝
    #[error("传输失败: {0}")]
    Transfer(String),

    /// 压缩暂存失败
    #[error("压缩失败: {0}")]
    Compression(String),
}
