use std::fmt;

/// 会话状态机的显式状态。
///
/// `None` 表示没有正在推进的握手；载荷读写在握手完成后各自以
/// `PayloadRead`/`PayloadWrite` 单独驱动，不改写握手状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    None,
    /// 建立（或为强制完整握手而重建）传输连接。
    TransportConnect,
    HandshakeRead,
    PayloadWrite,
    PayloadRead,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::None => "none",
            State::TransportConnect => "transport_connect",
            State::HandshakeRead => "handshake_read",
            State::PayloadWrite => "payload_write",
            State::PayloadRead => "payload_read",
        })
    }
}

/// 单步推进的结果。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step<T> {
    /// 需要等待传输层完成。
    Suspend,
    /// 立即进入下一个状态。
    Continue(State),
    /// 本轮操作完成。
    Complete(T),
}
