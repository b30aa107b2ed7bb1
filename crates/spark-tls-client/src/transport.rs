use std::{io, task::Poll};

use bytes::Bytes;

/// 传输层完成通知：恰好调用一次。
pub type IoCallback<T> = Box<dyn FnOnce(io::Result<T>) + 'static>;

/// 非阻塞字节流传输的最小契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TLS 会话不关心底层是 TCP、管道还是测试桩，只要求“要么立即完成，要么稍后回调一次”；
/// - 缓冲区以 `Bytes` 所有权传递，使挂起的读写可以安全地跨越调用边界存活。
///
/// ## 契约（What）
/// - 返回 `Poll::Ready(..)`：操作已同步完成，`on_complete` 会被直接丢弃，绝不调用；
/// - 返回 `Poll::Pending`：之后恰好调用一次 `on_complete`，且**不得**在本次调用内部触发；
/// - `read` 返回的字节数不超过 `max_len`，零字节表示对端有序关闭；
/// - 调用方保证同一方向最多一个未完成操作。
pub trait Transport {
    fn connect(&mut self, on_complete: IoCallback<()>) -> Poll<io::Result<()>>;

    fn read(&mut self, max_len: usize, on_complete: IoCallback<Bytes>) -> Poll<io::Result<Bytes>>;

    fn write(&mut self, data: Bytes, on_complete: IoCallback<usize>) -> Poll<io::Result<usize>>;

    /// 关闭连接。未完成操作的回调被丢弃。
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn is_connected_and_idle(&self) -> bool {
        self.is_connected()
    }
}
