//! FTP 会话边界
//!
//! `FtpSession` 把备份核心需要的协议原语抽象成能力接口：
//! 登录、被动模式、目录列表、建目录、非阻塞上传、原始命令。
//! `TcpFtpSession` 是随附的阻塞式 std::net 实现；
//! 加密传输需要外部提供支持 TLS 的会话实现。

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::ServerConfig;

/// 每次续传写入的数据块大小
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// 会话层错误
#[derive(Debug, Error)]
pub enum FtpError {
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
    #[error("服务器响应异常 ({command}): {reply}")]
    UnexpectedReply { command: String, reply: String },
    #[error("当前会话实现不支持加密传输")]
    SecureTransportUnsupported,
    #[error("没有进行中的传输")]
    NoTransferInProgress,
}

/// 传输模式（按扩展名选择）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Ascii,
    Binary,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Ascii => "ASCII",
            TransferMode::Binary => "BINARY",
        }
    }
}

/// 非阻塞上传的续传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// 还有数据未发送，需继续调用 `put_continue`
    MoreData,
    /// 传输完成，服务器已确认
    Finished,
}

/// 协议会话能力接口
pub trait FtpSession {
    /// 提交凭据
    fn login(&mut self, user: &str, pass: &str) -> Result<(), FtpError>;

    /// 切换被动模式（尽力而为，不使会话失败）
    fn set_passive(&mut self, enabled: bool) -> Result<(), FtpError>;

    /// 查询服务器系统类型（如 "UNIX"）
    fn system_type(&mut self) -> Result<String, FtpError>;

    /// 切换远程工作目录
    fn change_dir(&mut self, path: &str) -> Result<(), FtpError>;

    /// 获取目录的原始列表行
    fn list(&mut self, path: &str) -> Result<Vec<String>, FtpError>;

    /// 创建远程目录
    fn make_dir(&mut self, path: &str) -> Result<(), FtpError>;

    /// 发起非阻塞上传，之后用 `put_continue` 推进
    fn put_nonblocking(
        &mut self,
        remote_path: &str,
        source: Box<dyn Read>,
        mode: TransferMode,
    ) -> Result<PutStatus, FtpError>;

    /// 推进一次上传，返回是否完成
    fn put_continue(&mut self) -> Result<PutStatus, FtpError>;

    /// 发送原始命令并返回响应首行
    fn raw(&mut self, command: &str) -> Result<String, FtpError>;

    /// 结束会话
    fn quit(&mut self) -> Result<(), FtpError>;
}

/// 会话工厂：按服务器配置建立已连接的会话
pub trait FtpDialer {
    fn dial(&self, server: &ServerConfig) -> Result<Box<dyn FtpSession>, FtpError>;
}

// ============ 阻塞式 TCP 实现 ============

/// 进行中的上传
struct ActivePut {
    data: TcpStream,
    source: Box<dyn Read>,
    ascii: bool,
    /// 跨块跟踪上一个字节，用于 LF -> CRLF 转换
    prev_byte: u8,
}

/// 数据连接的建立方式
enum DataSetup {
    /// PASV：已连接的数据套接字
    Passive(TcpStream),
    /// PORT：等待服务器回连的监听器
    Active(TcpListener),
}

/// 基于 std::net 的阻塞 FTP 会话
pub struct TcpFtpSession {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    passive: bool,
    put: Option<ActivePut>,
}

impl TcpFtpSession {
    /// 连接控制通道并读取服务器问候
    fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, FtpError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "无法解析服务器地址"))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let writer = stream.try_clone()?;
        let mut session = Self {
            reader: BufReader::new(stream),
            writer,
            passive: false,
            put: None,
        };

        let greeting = session.read_reply()?;
        if !greeting.starts_with("220") {
            return Err(FtpError::UnexpectedReply {
                command: "<connect>".to_string(),
                reply: greeting,
            });
        }
        Ok(session)
    }

    /// 读取一条响应，多行响应（`ddd-`）读到结束行，返回首行
    fn read_reply(&mut self) -> Result<String, FtpError> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        if line.is_empty() {
            return Err(FtpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "控制连接已关闭",
            )));
        }
        let first = line.trim_end().to_string();
        trace!("<- {}", first);

        if first.len() >= 4 && first.as_bytes()[3] == b'-' {
            let terminator = format!("{} ", &first[..3]);
            loop {
                let mut cont = String::new();
                self.reader.read_line(&mut cont)?;
                if cont.is_empty() {
                    return Err(FtpError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "多行响应未结束",
                    )));
                }
                if cont.starts_with(&terminator) {
                    break;
                }
            }
        }
        Ok(first)
    }

    fn send_command(&mut self, command: &str) -> Result<(), FtpError> {
        trace!("-> {}", command);
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// 发送命令并校验响应码前缀
    fn command_expect(&mut self, command: &str, prefixes: &[&str]) -> Result<String, FtpError> {
        self.send_command(command)?;
        let reply = self.read_reply()?;
        if prefixes.iter().any(|p| reply.starts_with(p)) {
            Ok(reply)
        } else {
            Err(FtpError::UnexpectedReply {
                command: command.to_string(),
                reply,
            })
        }
    }

    /// 为即将到来的数据传输准备数据连接
    fn prepare_data(&mut self) -> Result<DataSetup, FtpError> {
        if self.passive {
            let reply = self.command_expect("PASV", &["227"])?;
            let addr = parse_pasv_reply(&reply).ok_or_else(|| FtpError::UnexpectedReply {
                command: "PASV".to_string(),
                reply,
            })?;
            let stream = TcpStream::connect(addr)?;
            Ok(DataSetup::Passive(stream))
        } else {
            let local = self.writer.local_addr()?;
            let listener = TcpListener::bind((local.ip(), 0))?;
            let port = listener.local_addr()?.port();
            let host_part = match local.ip() {
                std::net::IpAddr::V4(v4) => {
                    let o = v4.octets();
                    format!("{},{},{},{}", o[0], o[1], o[2], o[3])
                }
                std::net::IpAddr::V6(_) => {
                    return Err(FtpError::Io(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "PORT 模式不支持 IPv6",
                    )))
                }
            };
            let command = format!("PORT {},{},{}", host_part, port / 256, port % 256);
            self.command_expect(&command, &["200"])?;
            Ok(DataSetup::Active(listener))
        }
    }

    /// 推进上传一个数据块
    fn put_step(&mut self) -> Result<PutStatus, FtpError> {
        let put = self.put.as_mut().ok_or(FtpError::NoTransferInProgress)?;

        let mut buf = [0u8; DATA_CHUNK_SIZE];
        let n = put.source.read(&mut buf)?;
        if n == 0 {
            // 发送完毕：关闭数据连接让服务器看到 EOF，再读最终响应
            if let Some(done) = self.put.take() {
                let _ = done.data.shutdown(Shutdown::Both);
            }
            let reply = self.read_reply()?;
            if reply.starts_with('2') {
                return Ok(PutStatus::Finished);
            }
            return Err(FtpError::UnexpectedReply {
                command: "STOR".to_string(),
                reply,
            });
        }

        if put.ascii {
            let mut translated = Vec::with_capacity(n + n / 8);
            for &b in &buf[..n] {
                if b == b'\n' && put.prev_byte != b'\r' {
                    translated.push(b'\r');
                }
                translated.push(b);
                put.prev_byte = b;
            }
            put.data.write_all(&translated)?;
        } else {
            put.data.write_all(&buf[..n])?;
        }
        Ok(PutStatus::MoreData)
    }
}

impl FtpSession for TcpFtpSession {
    fn login(&mut self, user: &str, pass: &str) -> Result<(), FtpError> {
        self.send_command(&format!("USER {}", user))?;
        let reply = self.read_reply()?;
        if reply.starts_with("230") {
            return Ok(());
        }
        if !reply.starts_with("331") {
            return Err(FtpError::UnexpectedReply {
                command: "USER".to_string(),
                reply,
            });
        }
        self.command_expect(&format!("PASS {}", pass), &["230"])?;
        Ok(())
    }

    fn set_passive(&mut self, enabled: bool) -> Result<(), FtpError> {
        // PASV 在每次数据连接时协商，这里只记录开关
        self.passive = enabled;
        debug!("被动模式: {}", enabled);
        Ok(())
    }

    fn system_type(&mut self) -> Result<String, FtpError> {
        let reply = self.command_expect("SYST", &["215"])?;
        let systype = reply
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();
        Ok(systype)
    }

    fn change_dir(&mut self, path: &str) -> Result<(), FtpError> {
        self.command_expect(&format!("CWD {}", path), &["250", "200"])?;
        Ok(())
    }

    fn list(&mut self, path: &str) -> Result<Vec<String>, FtpError> {
        self.command_expect("TYPE A", &["200"])?;
        let setup = self.prepare_data()?;
        self.command_expect(&format!("LIST {}", path), &["150", "125"])?;

        let data = match setup {
            DataSetup::Passive(stream) => stream,
            DataSetup::Active(listener) => listener.accept()?.0,
        };

        let mut lines = Vec::new();
        for line in BufReader::new(data).lines() {
            let line = line?;
            if !line.is_empty() {
                lines.push(line);
            }
        }

        let reply = self.read_reply()?;
        if !reply.starts_with('2') {
            return Err(FtpError::UnexpectedReply {
                command: "LIST".to_string(),
                reply,
            });
        }
        Ok(lines)
    }

    fn make_dir(&mut self, path: &str) -> Result<(), FtpError> {
        self.command_expect(&format!("MKD {}", path), &["257"])?;
        Ok(())
    }

    fn put_nonblocking(
        &mut self,
        remote_path: &str,
        source: Box<dyn Read>,
        mode: TransferMode,
    ) -> Result<PutStatus, FtpError> {
        let type_cmd = match mode {
            TransferMode::Ascii => "TYPE A",
            TransferMode::Binary => "TYPE I",
        };
        self.command_expect(type_cmd, &["200"])?;

        let setup = self.prepare_data()?;
        self.command_expect(&format!("STOR {}", remote_path), &["150", "125"])?;

        let data = match setup {
            DataSetup::Passive(stream) => stream,
            DataSetup::Active(listener) => listener.accept()?.0,
        };

        self.put = Some(ActivePut {
            data,
            source,
            ascii: mode == TransferMode::Ascii,
            prev_byte: 0,
        });
        self.put_step()
    }

    fn put_continue(&mut self) -> Result<PutStatus, FtpError> {
        self.put_step()
    }

    fn raw(&mut self, command: &str) -> Result<String, FtpError> {
        self.send_command(command)?;
        self.read_reply()
    }

    fn quit(&mut self) -> Result<(), FtpError> {
        self.send_command("QUIT")?;
        let _ = self.read_reply();
        Ok(())
    }
}

/// 解析 PASV 响应中的 (h1,h2,h3,h4,p1,p2)
fn parse_pasv_reply(reply: &str) -> Option<(String, u16)> {
    // 优先取括号内的部分，没有括号则去掉响应码后扫描剩余文本
    let region = match (reply.find('('), reply.rfind(')')) {
        (Some(open), Some(close)) if open < close => &reply[open + 1..close],
        _ => reply.split_once(' ').map(|(_, rest)| rest).unwrap_or(reply),
    };

    let mut numbers = region
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u16>().ok());

    let mut fields = [0u16; 6];
    for field in fields.iter_mut() {
        *field = numbers.next()?;
    }
    // 六个字段都是单字节值
    if fields.iter().any(|&n| n > 255) {
        return None;
    }

    let host = format!("{}.{}.{}.{}", fields[0], fields[1], fields[2], fields[3]);
    let port = fields[4] * 256 + fields[5];
    Some((host, port))
}

/// 建立明文 TCP 会话的工厂
pub struct TcpFtpDialer;

impl FtpDialer for TcpFtpDialer {
    fn dial(&self, server: &ServerConfig) -> Result<Box<dyn FtpSession>, FtpError> {
        if server.use_secure {
            return Err(FtpError::SecureTransportUnsupported);
        }
        let timeout = Duration::from_secs(server.timeout_secs);
        let session = TcpFtpSession::connect(&server.host, server.port, timeout)?;
        Ok(Box::new(session))
    }
}

// ============ 测试用模拟会话 ============


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pasv_reply() {
        let reply = "227 Entering Passive Mode (192,168,1,10,19,136).";
        let (host, port) = parse_pasv_reply(reply).unwrap();
        assert_eq!(host, "192.168.1.10");
        assert_eq!(port, 19 * 256 + 136);
    }

    #[test]
    fn test_parse_pasv_reply_ignores_trailing_digits() {
        let reply = "227 Entering Passive Mode (192,168,1,10,19,136). Timeout 300";
        let (host, port) = parse_pasv_reply(reply).unwrap();
        assert_eq!(host, "192.168.1.10");
        assert_eq!(port, 19 * 256 + 136);
    }

    #[test]
    fn test_parse_pasv_reply_rejects_oversized_octets() {
        assert!(parse_pasv_reply("227 Entering Passive Mode (999,168,1,10,19,136).").is_none());
    }

    #[test]
    fn test_parse_pasv_reply_malformed() {
        assert!(parse_pasv_reply("500 Unknown command.").is_none());
    }
}
