#![doc = r#"
# spark-tls-client

## 设计动机（Why）
- **非阻塞之上的阻塞引擎**：TLS 库按“同步套接字”的形状读写，而真实传输只提供“立即完成或稍后回调”；
  本 crate 以内存桥接（[`MemoryBridge`]）加显式状态机把二者粘合起来；
- **软失败证书策略**：证书校验失败不在握手中途断开，而是在握手完成后与结论一并交付，
  由连接层决定如何呈现；
- **复用安全**：会话复用会跳过证书校验，若复用会话背后的证书发生变化，强制进行一次完整握手。

## 核心契约（What）
- [`Transport`]：非阻塞字节流的最小契约，缓冲区以 `Bytes` 所有权传递；
- [`TlsEngine`]：单步推进的 TLS 引擎契约，只面对 [`MemoryBridge`]；
- [`TlsClientSession`]：`connect`/`read`/`write` 返回 `Poll`，挂起时恰好回调一次；
- [`SessionError`]：带稳定错误码（`spark.tls_client.*`）的错误分类。

## 实现策略（How）
- 状态机每执行一步就抽送一次网络，每个方向至多一个未完成的传输操作；
- 传输完成回调携带纪元号，重启或断开之后的陈旧完成被忽略；
- 回调在释放内部借用后派发，允许在回调中重新进入会话。

## 风险与考量（Trade-offs）
- 会话是 `!Send` 的，必须在单一 I/O 上下文（例如 Tokio `LocalSet`）中驱动；
- 软失败意味着调用方必须检查 [`HandshakeOutcome`]，或使用 [`HandshakeOutcome::into_result`]。
"#]
#![cfg_attr(
    not(feature = "rustls"),
    doc = r#"## 功能开关：`rustls`

默认启用基于 rustls 的引擎适配层（`TlsConnector` 与 `RustlsEngine`）。禁用后 crate 只保留会话状态机、
桥接与各项契约，可与自定义 [`TlsEngine`] 实现组合使用。
"#
)]

mod bridge;
mod cache;
mod callback;
mod certificate;
mod config;
mod engine;
mod error;
mod session;
mod state;
mod transport;

#[cfg(feature = "runtime-tokio")]
mod tokio_transport;

pub use bridge::MemoryBridge;
pub use cache::SessionCache;
pub use callback::{ConnectResult, ReadResult, WriteResult};
pub use certificate::{
    BadCertificateDecision, CertificateHooks, CertificateRecord, CertificateValidator,
    CertificateVerdict,
};
pub use config::{
    DEFAULT_RECV_BUFFER_SIZE, DEFAULT_SEND_BUFFER_SIZE, DEFAULT_SESSION_CACHE_CAPACITY,
    TlsClientConfig, TlsVersion,
};
pub use engine::{NegotiatedParams, TlsEngine};
pub use error::{CertificateError, ConfigError, Direction, EngineError, SessionError};
pub use session::{HandshakeOutcome, SslInfo, TlsClientSession};
pub use state::State;
pub use transport::{IoCallback, Transport};

#[cfg(feature = "rustls")]
pub use engine::rustls_adapter::{RustlsEngine, TlsConnector, ensure_initialized};
#[cfg(feature = "runtime-tokio")]
pub use tokio_transport::TokioTcpTransport;
