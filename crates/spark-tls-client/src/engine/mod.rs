//! TLS 引擎适配层。
//!
//! 会话状态机只通过 [`TlsEngine`] 与具体 TLS 库交互：推进握手、加密发送、解密接收，
//! 以及注册证书钩子与使可恢复会话失效。引擎永远只面对 [`MemoryBridge`]，
//! 从不直接触碰传输层。

use std::sync::Arc;

use crate::{
    bridge::MemoryBridge, certificate::CertificateHooks, certificate::CertificateRecord,
    config::TlsVersion, error::EngineError,
};

#[cfg(feature = "rustls")]
pub mod rustls_adapter;

/// 握手完成后协商出的参数。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NegotiatedParams {
    pub version: Option<TlsVersion>,
    /// IANA 密码套件标识。
    pub cipher_suite: Option<u16>,
    pub alpn_protocol: Option<Vec<u8>>,
}

/// 面向会话状态机的 TLS 引擎契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 具体 TLS 库按同步 I/O 的形状工作；该 trait 把它收窄为若干“单步推进”操作，
///   每一步要么完成，要么以 [`EngineError::WouldBlock`] 告知需要更多传输 I/O；
/// - 证书钩子以 trait 对象注册，取代 C 风格的“不透明指针 + 静态回调”。
///
/// ## 契约（What）
/// - `register_certificate_hooks`：此后每次校验服务端证书都必须经过这组钩子，钩子的裁决决定握手能否继续；
/// - `handshake`：推进一轮握手；完成返回 `Ok(())`，对端在握手中关闭返回 [`EngineError::Closed`]；
/// - `write_payload`：接收明文并加密写入桥接，返回被接受的明文字节数；
/// - `read_payload`：解密并写入 `out`；`Ok(0)` 或 [`EngineError::Closed`] 表示流结束；
/// - `invalidate_session`：丢弃针对当前主机缓存的可恢复会话；
/// - `restart`：丢弃当前连接状态，准备在新的传输连接上重新握手；
/// - 实现不要求 `Send`：会话只在单一 I/O 上下文中驱动引擎。
pub trait TlsEngine {
    fn register_certificate_hooks(&mut self, hooks: Arc<dyn CertificateHooks>);

    fn handshake(&mut self, bridge: &mut MemoryBridge) -> Result<(), EngineError>;

    fn write_payload(&mut self, bridge: &mut MemoryBridge, data: &[u8])
    -> Result<usize, EngineError>;

    fn read_payload(&mut self, bridge: &mut MemoryBridge, out: &mut [u8])
    -> Result<usize, EngineError>;

    fn peer_certificate(&self) -> Option<CertificateRecord>;

    fn is_resumed(&self) -> bool;

    fn negotiated(&self) -> Option<NegotiatedParams>;

    fn invalidate_session(&mut self);

    fn restart(&mut self, allow_resumption: bool) -> Result<(), EngineError>;

    /// 把引擎内部尚未落入桥接的密文推入桥接。默认不做任何事。
    fn flush(&mut self, _bridge: &mut MemoryBridge) -> Result<(), EngineError> {
        Ok(())
    }

    /// 排队发送 close_notify。默认不做任何事。
    fn close(&mut self, _bridge: &mut MemoryBridge) {}
}
