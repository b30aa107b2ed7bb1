use std::io;

use bytes::{Buf, Bytes, BytesMut};

/// 内存桥接：以一对进程内缓冲区替代内核套接字。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TLS 引擎按“阻塞套接字”的形状调用 `read`/`write`，而真实传输是非阻塞、带完成回调的；
/// - 桥接对象把两种语义解耦：引擎只面对内存，缓冲区为空或写满时得到 `WouldBlock`，
///   会话再据此向传输层发起真正的 I/O。
///
/// ## 逻辑（How）
/// - 引擎侧：[`io::Read`] 取出已到达的密文，[`io::Write`] 追加待发送的密文；
/// - 网络侧：`read_params`/`put_read_result` 与 `write_params`/`put_write_result`
///   成对使用，`begin_*` 标记对应方向的传输操作处于挂起状态；
/// - 部分写出时剩余字节保留在 `in_flight` 中，下次优先重发，保证密文顺序不变。
///
/// ## 契约（What）
/// - 同一方向处于 busy 时，`read_params`/`write_params` 返回 `None`，从而杜绝重叠 I/O；
/// - 零字节读结果表示有序关闭：之后引擎读到 `Ok(0)`，且不再发起传输读。
#[derive(Debug)]
pub struct MemoryBridge {
    recv: BytesMut,
    recv_capacity: usize,
    recv_busy: bool,
    recv_closed: bool,
    send: BytesMut,
    send_capacity: usize,
    send_busy: bool,
    in_flight: Bytes,
}

impl MemoryBridge {
    pub fn new(recv_capacity: usize, send_capacity: usize) -> Self {
        Self {
            recv: BytesMut::with_capacity(recv_capacity),
            recv_capacity,
            recv_busy: false,
            recv_closed: false,
            send: BytesMut::with_capacity(send_capacity),
            send_capacity,
            send_busy: false,
            in_flight: Bytes::new(),
        }
    }

    /// 可向传输层请求读取的最大字节数；忙碌、已关闭或已满时返回 `None`。
    pub fn read_params(&self) -> Option<usize> {
        if self.recv_busy || self.recv_closed {
            return None;
        }
        let room = self.recv_capacity.saturating_sub(self.recv.len());
        (room > 0).then_some(room)
    }

    pub fn begin_recv(&mut self) {
        self.recv_busy = true;
    }

    /// 写入一次传输读的结果；空切片表示对端有序关闭。
    pub fn put_read_result(&mut self, data: &[u8]) {
        self.recv_busy = false;
        if data.is_empty() {
            self.recv_closed = true;
        } else {
            self.recv.extend_from_slice(data);
        }
    }

    pub fn abort_recv(&mut self) {
        self.recv_busy = false;
    }

    /// 下一段待发送的密文；忙碌或无数据时返回 `None`。
    pub fn write_params(&mut self) -> Option<Bytes> {
        if self.send_busy {
            return None;
        }
        if self.in_flight.is_empty() {
            if self.send.is_empty() {
                return None;
            }
            self.in_flight = self.send.split().freeze();
        }
        Some(self.in_flight.clone())
    }

    pub fn begin_send(&mut self) {
        self.send_busy = true;
    }

    /// 记录一次传输写实际写出的字节数。
    pub fn put_write_result(&mut self, written: usize) {
        self.send_busy = false;
        let consumed = written.min(self.in_flight.len());
        self.in_flight.advance(consumed);
    }

    pub fn abort_send(&mut self) {
        self.send_busy = false;
    }

    pub fn is_recv_busy(&self) -> bool {
        self.recv_busy
    }

    pub fn is_send_busy(&self) -> bool {
        self.send_busy
    }

    pub fn is_closed(&self) -> bool {
        self.recv_closed
    }

    /// 已到达但尚未被引擎取走的密文字节数。
    pub fn buffered_recv(&self) -> usize {
        self.recv.len()
    }

    /// 引擎已产出但尚未被传输层确认写出的密文字节数。
    pub fn pending_send(&self) -> usize {
        self.send.len() + self.in_flight.len()
    }

    /// 丢弃两侧全部状态，供强制重新握手前复位。
    pub fn reset(&mut self) {
        self.recv.clear();
        self.recv_busy = false;
        self.recv_closed = false;
        self.send.clear();
        self.send_busy = false;
        self.in_flight = Bytes::new();
    }
}

impl io::Read for MemoryBridge {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.recv.is_empty() {
            if self.recv_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let len = out.len().min(self.recv.len());
        out[..len].copy_from_slice(&self.recv[..len]);
        self.recv.advance(len);
        Ok(len)
    }
}

impl io::Write for MemoryBridge {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let room = self.send_capacity.saturating_sub(self.pending_send());
        if room == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let len = data.len().min(room);
        self.send.extend_from_slice(&data[..len]);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
