//! 日志模块 - 提供文件日志和大小轮转

use crate::config::LogConfig;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

const LOG_FILE_NAME: &str = "ftpmirror.log";

/// 带大小限制的日志写入器
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb as u64) * 1024 * 1024;

        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        // 现有文件超过限制则先轮转
        if file_path.exists() {
            if let Ok(metadata) = fs::metadata(file_path) {
                if metadata.len() > max_size {
                    Self::rotate_log(file_path)?;
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        Ok(BufWriter::new(file))
    }

    /// 轮转日志文件，旧内容保留在 .log.old
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)?;
        Ok(())
    }
}

impl Clone for SizeRotatingWriter {
    fn clone(&self) -> Self {
        Self {
            file_path: self.file_path.clone(),
            max_size: self.max_size,
            writer: self.writer.clone(),
        }
    }
}

/// 日志写入器包装
pub struct LogWriter {
    inner: Arc<Mutex<Option<BufWriter<File>>>>,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();

        if let Some(ref mut writer) = *guard {
            let result = writer.write(buf)?;
            writer.flush()?;

            // 写入后检查文件大小，超限则轮转并重开
            if let Ok(metadata) = fs::metadata(&self.file_path) {
                if metadata.len() > self.max_size {
                    if let Some(mut w) = guard.take() {
                        let _ = w.flush();
                    }
                    let _ = SizeRotatingWriter::rotate_log(&self.file_path);
                    if let Ok(new_writer) =
                        SizeRotatingWriter::open_file(&self.file_path, self.max_size)
                    {
                        *guard = Some(new_writer);
                    }
                }
            }

            Ok(result)
        } else {
            Err(io::Error::new(io::ErrorKind::Other, "Writer not available"))
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(ref mut writer) = *guard {
            writer.flush()
        } else {
            Ok(())
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 初始化日志系统：控制台始终输出，文件日志按配置开启。
/// verbose 把级别强制到 debug。
pub fn init_logging(config: &LogConfig, verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let env_filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    // 控制台层在每个分支各自构造，两条订阅链的具体类型不同
    if config.enabled {
        match SizeRotatingWriter::new(Path::new(&config.dir), config.max_size_mb) {
            Ok(file_writer) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);

                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
                return;
            }
            Err(e) => {
                eprintln!("创建日志文件失败，回退到控制台: {}", e);
            }
        }
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_keeps_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join(LOG_FILE_NAME);
        fs::write(&log_path, b"previous run").unwrap();

        SizeRotatingWriter::rotate_log(&log_path).unwrap();

        let backup = log_path.with_extension("log.old");
        assert!(!log_path.exists());
        assert_eq!(fs::read(&backup).unwrap(), b"previous run");
    }

    #[test]
    fn test_init_logging_covers_both_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            enabled: true,
            dir: dir.path().to_str().unwrap().to_string(),
            max_size_mb: 1,
            level: "info".to_string(),
        };
        // 文件 + 控制台链
        init_logging(&config, false);
        assert!(dir.path().join(LOG_FILE_NAME).exists());

        // 纯控制台链（全局订阅器已设置，二次调用静默返回）
        let disabled = LogConfig {
            enabled: false,
            ..config
        };
        init_logging(&disabled, true);
    }

    #[test]
    fn test_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let rotating = SizeRotatingWriter::new(dir.path(), 5).unwrap();

        let mut writer = rotating.make_writer();
        writer.write_all(b"line one\n").unwrap();
        writer.write_all(b"line two\n").unwrap();
        writer.flush().unwrap();

        let content = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert!(content.contains("line one"));
        assert!(content.contains("line two"));
    }
}
