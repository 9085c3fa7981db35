//! 备份运行配置模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// FTP 服务器连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// 服务器地址（域名或 IP）
    pub host: String,
    /// 服务器端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// 等待服务器响应的秒数，设置过低会增加传输错误的概率
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 登录用户名
    pub username: String,
    /// 登录密码
    pub password: String,
    /// 是否使用加密传输（需要支持 TLS 的会话实现）
    #[serde(default)]
    pub use_secure: bool,
    /// 是否使用 PASV 被动模式
    #[serde(default)]
    pub use_passive: bool,
}

fn default_port() -> u16 {
    21
}

fn default_timeout_secs() -> u64 {
    10
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志目录
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            dir: default_log_dir(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 一次备份运行的完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// 服务器连接参数
    pub server: ServerConfig,
    /// 要备份的本地目录
    pub local_root: String,
    /// 远程备份目录，需以 / 开头和结尾，如 /backup/site/
    pub remote_root: String,
    /// 本地分析时忽略的文件扩展名（小写）
    #[serde(default)]
    pub ignored_extensions: Vec<String>,
    /// 跳过的目录相对路径（两侧通用，形如 /cache/，不区分大小写）
    #[serde(default)]
    pub ignored_dirs: Vec<String>,
    /// 以 ASCII 模式上传的扩展名，其余用二进制
    #[serde(default = "default_ascii_extensions")]
    pub ascii_extensions: Vec<String>,
    /// 上传前需要压缩的文件名
    #[serde(default)]
    pub compress_names: Vec<String>,
    /// 上传前需要压缩的扩展名
    #[serde(default)]
    pub compress_extensions: Vec<String>,
    /// 压缩产物是否保留原扩展名（file.mdb.gz 而不是 file.gz）
    #[serde(default = "default_true")]
    pub keep_original_extension: bool,
    /// 远程已有同名文件时是否覆盖；关闭则改名上传以保留历史
    #[serde(default = "default_true")]
    pub overwrite_remote: bool,
    /// 预览模式：只分析差异，不压缩也不上传
    #[serde(default)]
    pub preview_only: bool,
    /// 详细日志（将级别降到 debug，明显拖慢运行）
    #[serde(default)]
    pub verbose: bool,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_true() -> bool {
    true
}

fn default_ascii_extensions() -> Vec<String> {
    [
        "txt", "htm", "html", "pas", "c", "cpp", "h", "bas", "tex", "as", "ascx", "asmx", "asp",
        "aspx", "cfm", "cfml", "cgi", "cs", "css", "dwt", "inc", "lbi", "php", "shtm", "shtml",
        "text", "vb", "xhtm", "xhtml", "js",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl BackupConfig {
    /// 从 JSON 配置文件加载
    pub fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// 保存为 JSON 配置文件
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{
            "server": {"host": "ftp.example.com", "username": "u", "password": "p"},
            "localRoot": "/data/site",
            "remoteRoot": "/backup/site/"
        }"#;
        let config: BackupConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.port, 21);
        assert_eq!(config.server.timeout_secs, 10);
        assert!(!config.server.use_passive);
        assert!(config.overwrite_remote);
        assert!(config.keep_original_extension);
        assert!(!config.preview_only);
        assert!(config.ascii_extensions.contains(&"html".to_string()));
        assert_eq!(config.log.max_size_mb, 5);
    }
}
