use std::{cell::RefCell, io, net::SocketAddr, rc::Rc, task::Poll};

use bytes::{Bytes, BytesMut};
use tokio::{net::TcpStream, task::JoinHandle};
use tracing::debug;

use crate::transport::{IoCallback, Transport};

type StreamSlot = Rc<RefCell<Option<Rc<TcpStream>>>>;

/// 基于 Tokio `TcpStream` 的非阻塞传输。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为 TLS 会话提供真实的 TCP 传输，同时满足“不得在调用内部触发完成回调”的契约；
/// - 会话本身是 `!Send` 的，因此挂起的 I/O 以 `spawn_local` 任务承载，必须运行在 `LocalSet` 中。
///
/// ## 逻辑（How）
/// - 读写先走 `try_read`/`try_write` 同步快路径，命中即返回 `Poll::Ready`；
/// - 遇到 `WouldBlock` 时派生本地任务等待就绪，再把结果交给回调；
/// - `connect` 总是异步完成，并开启 `TCP_NODELAY`。
///
/// ## 契约（What）
/// - `disconnect` 中止所有未完成任务（其回调随任务一起被丢弃，不会被调用），并释放流；
/// - 每个方向同时至多一个任务，由会话保证。
#[derive(Debug)]
pub struct TokioTcpTransport {
    addr: SocketAddr,
    stream: StreamSlot,
    connect_task: Option<JoinHandle<()>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl TokioTcpTransport {
    /// 创建尚未连接的传输；首次 `connect` 时拨号 `addr`。
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: Rc::new(RefCell::new(None)),
            connect_task: None,
            read_task: None,
            write_task: None,
        }
    }

    /// 包装一条已建立的连接。
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;
        Ok(Self {
            addr,
            stream: Rc::new(RefCell::new(Some(Rc::new(stream)))),
            connect_task: None,
            read_task: None,
            write_task: None,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    fn current(&self) -> io::Result<Rc<TcpStream>> {
        self.stream
            .borrow()
            .clone()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl Transport for TokioTcpTransport {
    fn connect(&mut self, on_complete: IoCallback<()>) -> Poll<io::Result<()>> {
        if self.stream.borrow().is_some() {
            return Poll::Ready(Ok(()));
        }
        let addr = self.addr;
        let slot = Rc::clone(&self.stream);
        self.connect_task = Some(tokio::task::spawn_local(async move {
            let result = match TcpStream::connect(addr).await {
                Ok(stream) => stream.set_nodelay(true).map(|()| {
                    debug!(%addr, "tcp connection established");
                    *slot.borrow_mut() = Some(Rc::new(stream));
                }),
                Err(error) => Err(error),
            };
            on_complete(result);
        }));
        Poll::Pending
    }

    fn read(&mut self, max_len: usize, on_complete: IoCallback<Bytes>) -> Poll<io::Result<Bytes>> {
        let stream = match self.current() {
            Ok(stream) => stream,
            Err(error) => return Poll::Ready(Err(error)),
        };
        let mut buf = BytesMut::zeroed(max_len);
        match stream.try_read(&mut buf) {
            Ok(read) => return Poll::Ready(Ok(buf.split_to(read).freeze())),
            Err(error) if error.kind() != io::ErrorKind::WouldBlock => {
                return Poll::Ready(Err(error));
            }
            Err(_) => {}
        }
        self.read_task = Some(tokio::task::spawn_local(async move {
            let result = loop {
                if let Err(error) = stream.readable().await {
                    break Err(error);
                }
                match stream.try_read(&mut buf) {
                    Ok(read) => break Ok(buf.split_to(read).freeze()),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(error) => break Err(error),
                }
            };
            on_complete(result);
        }));
        Poll::Pending
    }

    fn write(&mut self, data: Bytes, on_complete: IoCallback<usize>) -> Poll<io::Result<usize>> {
        let stream = match self.current() {
            Ok(stream) => stream,
            Err(error) => return Poll::Ready(Err(error)),
        };
        match stream.try_write(&data) {
            Ok(written) => return Poll::Ready(Ok(written)),
            Err(error) if error.kind() != io::ErrorKind::WouldBlock => {
                return Poll::Ready(Err(error));
            }
            Err(_) => {}
        }
        self.write_task = Some(tokio::task::spawn_local(async move {
            let result = loop {
                if let Err(error) = stream.writable().await {
                    break Err(error);
                }
                match stream.try_write(&data) {
                    Ok(written) => break Ok(written),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(error) => break Err(error),
                }
            };
            on_complete(result);
        }));
        Poll::Pending
    }

    fn disconnect(&mut self) {
        for task in [
            self.connect_task.take(),
            self.read_task.take(),
            self.write_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        if self.stream.borrow_mut().take().is_some() {
            debug!(addr = %self.addr, "tcp connection released");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.borrow().is_some()
    }
}

impl Drop for TokioTcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
