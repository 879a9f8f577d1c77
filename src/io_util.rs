//! 非阻塞 I/O 结果
//!
//! 明文 socket 与 TLS 会话共用同一组带标签的结果类型，
//! WouldBlock 只是流控信号，不是错误

use std::io::{self, Read, Write};

/// 一次非阻塞读取的结果
#[derive(Debug)]
pub enum ReadOutcome {
    /// 读到了 n 个字节（n > 0）
    Data(usize),
    /// 暂无数据，等待下一次可读通知
    WouldBlock,
    /// 对端正常关闭
    Closed,
    /// 不可恢复的传输或协议错误
    Failed(io::Error),
}

/// 一次非阻塞写入的结果
#[derive(Debug)]
pub enum WriteOutcome {
    /// 写入了 n 个字节（n > 0）
    Data(usize),
    /// 对端暂时无法接收，等待下一次可写通知
    WouldBlock,
    /// 不可恢复的传输或协议错误
    Failed(io::Error),
}

impl ReadOutcome {
    pub fn is_would_block(&self) -> bool {
        matches!(self, ReadOutcome::WouldBlock)
    }
}

impl WriteOutcome {
    pub fn is_would_block(&self) -> bool {
        matches!(self, WriteOutcome::WouldBlock)
    }
}

/// 判断是否为 WouldBlock 错误
pub fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// 从明文 socket 读取一次
///
/// `buf` 不能为空，否则 `Ok(0)` 无法与对端关闭区分
pub fn recv<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    debug_assert!(!buf.is_empty());
    loop {
        match reader.read(buf) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => return ReadOutcome::Data(n),
            Err(e) if is_would_block(&e) => return ReadOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
}

/// 向明文 socket 写入一次
pub fn send<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> WriteOutcome {
    debug_assert!(!buf.is_empty());
    loop {
        match writer.write(buf) {
            Ok(0) => {
                return WriteOutcome::Failed(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ))
            }
            Ok(n) => return WriteOutcome::Data(n),
            Err(e) if is_would_block(&e) => return WriteOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return WriteOutcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// 按脚本返回结果的读取器
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_recv_outcomes() {
        let mut reader = Scripted(VecDeque::from(vec![
            Err(io::ErrorKind::Interrupted.into()),
            Ok(b"abc".to_vec()),
            Ok(Vec::new()),
            Err(io::ErrorKind::ConnectionReset.into()),
        ]));
        let mut buf = [0u8; 16];

        assert!(matches!(recv(&mut reader, &mut buf), ReadOutcome::Data(3)));
        assert_eq!(&buf[..3], b"abc");
        assert!(matches!(recv(&mut reader, &mut buf), ReadOutcome::Closed));
        assert!(matches!(
            recv(&mut reader, &mut buf),
            ReadOutcome::Failed(ref e) if e.kind() == io::ErrorKind::ConnectionReset
        ));
        assert!(recv(&mut reader, &mut buf).is_would_block());
    }

    #[test]
    fn test_send_outcomes() {
        let mut sink: Vec<u8> = Vec::new();
        assert!(matches!(send(&mut sink, b"hello"), WriteOutcome::Data(5)));
        assert_eq!(sink, b"hello");

        let mut full: &mut [u8] = &mut [];
        assert!(matches!(
            send(&mut full, b"x"),
            WriteOutcome::Failed(ref e) if e.kind() == io::ErrorKind::WriteZero
        ));
    }
}
