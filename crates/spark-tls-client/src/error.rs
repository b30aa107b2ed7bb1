use std::{borrow::Cow, fmt, io, sync::Arc};

use thiserror::Error;

/// TLS 客户端会话的错误分类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“传输层失败”“握手失败”“证书失败”“协议违规”与“调用方契约违规”显式区分，
///   使上层能够依据类别决定重连、告警或直接上报；
/// - 为每个错误提供稳定错误码（`spark.tls_client.*`），运维脚本与测试无需解析文案即可定位。
///
/// ## 逻辑（How）
/// - `WouldBlock` 不属于错误：对外表现为 `Poll::Pending`，对内由 [`EngineError::WouldBlock`] 表达；
/// - 传输层错误以 `Arc<io::Error>` 保存，使错误可 `Clone`，从而在会话进入终态后对后续调用快速失败；
/// - 契约类错误（重复挂起、握手未完成等）不会污染会话状态。
///
/// ## 契约（What）
/// - [`SessionError::code`] 返回稳定错误码；
/// - [`SessionError::is_fatal`] 指示错误是否使会话进入终态。
#[derive(Clone, Debug, Error)]
pub enum SessionError {
    /// 握手阶段读到零字节：对端有序关闭。
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// 传输层失败，原样透传。
    #[error("transport failure during {op}: {source}")]
    Transport {
        op: &'static str,
        source: Arc<io::Error>,
    },
    /// 引擎拒绝了协商。
    #[error("tls handshake failed: {0}")]
    Handshake(Cow<'static, str>),
    /// 证书校验失败。
    #[error("certificate verification failed: {0}")]
    Certificate(#[from] CertificateError),
    /// TLS 分帧或记录层格式错误。
    #[error("tls protocol violation: {0}")]
    Protocol(Cow<'static, str>),
    /// 同一方向已有挂起操作。
    #[error("a {0} operation is already pending")]
    OperationPending(Direction),
    /// 握手尚未完成时发起了载荷读写。
    #[error("tls handshake has not completed")]
    HandshakeIncomplete,
    /// 会话未连接（例如已断开后再次调用）。
    #[error("session is not connected")]
    NotConnected,
    /// 挂起操作因显式断开而终止。
    #[error("session was disconnected")]
    Disconnected,
}

impl SessionError {
    pub(crate) fn transport(op: &'static str, error: io::Error) -> Self {
        SessionError::Transport {
            op,
            source: Arc::new(error),
        }
    }

    /// 稳定错误码，与 `spark.transport.tls.*` 的命名方式保持一致。
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::ConnectionClosed => "spark.tls_client.connection_closed",
            SessionError::Transport { .. } => "spark.tls_client.transport_failed",
            SessionError::Handshake(_) => "spark.tls_client.handshake_failed",
            SessionError::Certificate(_) => "spark.tls_client.certificate_failed",
            SessionError::Protocol(_) => "spark.tls_client.protocol_violation",
            SessionError::OperationPending(_) => "spark.tls_client.operation_pending",
            SessionError::HandshakeIncomplete => "spark.tls_client.handshake_incomplete",
            SessionError::NotConnected => "spark.tls_client.not_connected",
            SessionError::Disconnected => "spark.tls_client.disconnected",
        }
    }

    /// 错误是否使会话进入终态。
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::OperationPending(_)
                | SessionError::HandshakeIncomplete
                | SessionError::NotConnected
        )
    }

    /// 底层传输错误（若有）。
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            SessionError::Transport { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// 挂起操作所属的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Connect,
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Connect => "connect",
            Direction::Read => "read",
            Direction::Write => "write",
        })
    }
}

/// 证书校验失败的具体原因。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("certificate issuer is not trusted")]
    UnknownIssuer,
    #[error("certificate has expired")]
    Expired,
    #[error("certificate is not yet valid")]
    NotYetValid,
    #[error("certificate is not valid for the requested host")]
    NameMismatch,
    #[error("certificate has been revoked")]
    Revoked,
    #[error("certificate signature is invalid")]
    BadSignature,
    #[error("peer presented no certificate")]
    Missing,
    #[error("peer certificate changed on session resumption")]
    ChangedOnResumption,
    #[error("certificate rejected: {0}")]
    Other(Cow<'static, str>),
}

impl CertificateError {
    pub fn code(&self) -> &'static str {
        match self {
            CertificateError::UnknownIssuer => "spark.tls_client.cert.unknown_issuer",
            CertificateError::Expired => "spark.tls_client.cert.expired",
            CertificateError::NotYetValid => "spark.tls_client.cert.not_yet_valid",
            CertificateError::NameMismatch => "spark.tls_client.cert.name_mismatch",
            CertificateError::Revoked => "spark.tls_client.cert.revoked",
            CertificateError::BadSignature => "spark.tls_client.cert.bad_signature",
            CertificateError::Missing => "spark.tls_client.cert.missing",
            CertificateError::ChangedOnResumption => "spark.tls_client.cert.changed_on_resumption",
            CertificateError::Other(_) => "spark.tls_client.cert.other",
        }
    }
}

/// TLS 引擎适配层的单步结果错误。
///
/// `WouldBlock` 是挂起信号而非故障：引擎需要更多密文输入，或发送区已满。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("tls engine would block")]
    WouldBlock,
    #[error("peer closed the connection")]
    Closed,
    #[error("handshake failure: {0}")]
    Handshake(Cow<'static, str>),
    #[error("certificate failure: {0}")]
    Certificate(CertificateError),
    #[error("protocol violation: {0}")]
    Protocol(Cow<'static, str>),
}

impl EngineError {
    /// 将非挂起的引擎错误映射为会话错误；`WouldBlock` 与 `Closed` 由调用方按阶段解释。
    pub(crate) fn into_session_error(self) -> SessionError {
        match self {
            EngineError::WouldBlock => {
                SessionError::Protocol(Cow::Borrowed("unexpected would-block from tls engine"))
            }
            EngineError::Closed => SessionError::ConnectionClosed,
            EngineError::Handshake(message) => SessionError::Handshake(message),
            EngineError::Certificate(error) => SessionError::Certificate(error),
            EngineError::Protocol(message) => SessionError::Protocol(message),
        }
    }
}

/// 配置加载与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid tls client configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("min_version {min} exceeds max_version {max}")]
    VersionRange {
        min: crate::config::TlsVersion,
        max: crate::config::TlsVersion,
    },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("every cipher suite was disabled")]
    NoCipherSuites,
    #[error("invalid server name `{0}`")]
    ServerName(String),
    #[error("tls engine rejected configuration: {0}")]
    Engine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_errors_do_not_poison_the_session() {
        assert!(!SessionError::OperationPending(Direction::Read).is_fatal());
        assert!(!SessionError::HandshakeIncomplete.is_fatal());
        assert!(SessionError::ConnectionClosed.is_fatal());
        assert!(SessionError::transport("read", io::ErrorKind::BrokenPipe.into()).is_fatal());
    }

    #[test]
    fn transport_error_keeps_source_and_code() {
        let error = SessionError::transport("write", io::ErrorKind::ConnectionReset.into());
        assert_eq!(error.code(), "spark.tls_client.transport_failed");
        assert_eq!(
            error.io_error().map(io::Error::kind),
            Some(io::ErrorKind::ConnectionReset)
        );
        let cloned = error.clone();
        assert!(cloned.to_string().starts_with("transport failure during write"));
    }

    #[test]
    fn engine_errors_map_by_phase() {
        assert!(matches!(
            EngineError::Closed.into_session_error(),
            SessionError::ConnectionClosed
        ));
        assert!(matches!(
            EngineError::Certificate(CertificateError::Expired).into_session_error(),
            SessionError::Certificate(CertificateError::Expired)
        ));
        assert_eq!(
            SessionError::OperationPending(Direction::Write).to_string(),
            "a write operation is already pending"
        );
    }
}
