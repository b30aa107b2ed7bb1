use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::CertificateError;

/// 对端证书记录：终端实体证书、中间证书与 SHA-256 指纹。
///
/// 两条记录“身份相同”当且仅当终端实体证书的指纹相同。
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    end_entity: Bytes,
    intermediates: Vec<Bytes>,
    fingerprint: [u8; 32],
}

impl CertificateRecord {
    pub fn new(end_entity: impl Into<Bytes>) -> Self {
        Self::with_intermediates(end_entity, Vec::new())
    }

    pub fn with_intermediates(end_entity: impl Into<Bytes>, intermediates: Vec<Bytes>) -> Self {
        let end_entity = end_entity.into();
        let fingerprint = Sha256::digest(&end_entity).into();
        Self {
            end_entity,
            intermediates,
            fingerprint,
        }
    }

    /// 从 DER 切片链构造记录，第一个元素为终端实体证书。
    pub fn from_chain<'a>(
        end_entity: &[u8],
        intermediates: impl IntoIterator<Item = &'a [u8]>,
    ) -> Self {
        Self::with_intermediates(
            Bytes::copy_from_slice(end_entity),
            intermediates
                .into_iter()
                .map(Bytes::copy_from_slice)
                .collect(),
        )
    }

    pub fn der(&self) -> &[u8] {
        &self.end_entity
    }

    pub fn intermediates(&self) -> &[Bytes] {
        &self.intermediates
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }

    pub fn same_identity(&self, other: &CertificateRecord) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("sha256", &self.fingerprint_hex())
            .field("der_len", &self.end_entity.len())
            .field("intermediates", &self.intermediates.len())
            .finish()
    }
}

/// 握手完成时对证书的最终判定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateVerdict {
    /// 本次完整握手中证书通过校验。
    Trusted,
    /// 校验失败，但握手按软失败策略继续完成。
    Failed(CertificateError),
    /// 会话复用：引擎未重新校验，证书继承自先前已校验的会话。
    Inherited,
}

impl CertificateVerdict {
    pub fn error(&self) -> Option<&CertificateError> {
        match self {
            CertificateVerdict::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// 坏证书回调的处置指令。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BadCertificateDecision {
    /// 记录失败并继续握手，最终由会话层决定如何上报。
    Continue,
    /// 立即中止握手。
    Reject,
}

/// 向 TLS 引擎注册的证书钩子。
///
/// # 契约（What）
/// - 两个钩子都在握手轮次内同步调用；
/// - `on_auth_certificate` 在引擎得到候选证书链并完成自身校验后调用，只记录、不中止；
/// - `on_bad_certificate` 仅在引擎自身校验失败时调用，其返回值决定握手是否继续；
/// - 实现需满足 `Send + Sync`：引擎（例如 rustls 的校验器）可能要求跨线程共享。
pub trait CertificateHooks: Send + Sync + fmt::Debug {
    fn on_auth_certificate(
        &self,
        candidate: CertificateRecord,
        outcome: &Result<(), CertificateError>,
    );

    fn on_bad_certificate(&self, error: &CertificateError) -> BadCertificateDecision;
}

#[derive(Debug, Default)]
struct ValidatorState {
    candidate: Option<CertificateRecord>,
    outcome: Option<Result<(), CertificateError>>,
    bad_certificate: Option<CertificateError>,
}

/// 软失败证书校验器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书问题如何呈现给调用方由连接层决定，而不是由 TLS 库在握手中途直接断开；
/// - 因此两个钩子都只记录结果并放行，最终判定在握手完成后统一折叠进连接结果。
///
/// ## 逻辑（How）
/// - `on_auth_certificate` 保存候选证书与引擎校验结论；
/// - `on_bad_certificate` 保存失败原因并返回 [`BadCertificateDecision::Continue`]；
/// - [`CertificateValidator::verdict`] 在握手后汇总：从未被调用即视为会话复用（`Inherited`）。
///
/// ## 风险与权衡（Trade-offs）
/// - 软失败意味着加密通道可能建立在不可信证书之上，调用方必须检查 `HandshakeOutcome`；
/// - 内部使用 `parking_lot::Mutex`，仅为满足引擎侧 `Send + Sync` 约束，会话本身始终单线程访问。
#[derive(Debug, Default)]
pub struct CertificateValidator {
    state: Mutex<ValidatorState>,
}

impl CertificateValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 汇总本轮握手的判定结果。
    pub fn verdict(&self) -> CertificateVerdict {
        let state = self.state.lock();
        if let Some(error) = &state.bad_certificate {
            return CertificateVerdict::Failed(error.clone());
        }
        match &state.outcome {
            Some(Ok(())) => CertificateVerdict::Trusted,
            Some(Err(error)) => CertificateVerdict::Failed(error.clone()),
            None => CertificateVerdict::Inherited,
        }
    }

    /// 引擎在本轮握手中提交的候选证书。
    pub fn candidate(&self) -> Option<CertificateRecord> {
        self.state.lock().candidate.clone()
    }

    pub fn reset(&self) {
        *self.state.lock() = ValidatorState::default();
    }
}

impl CertificateHooks for CertificateValidator {
    fn on_auth_certificate(
        &self,
        candidate: CertificateRecord,
        outcome: &Result<(), CertificateError>,
    ) {
        debug!(
            sha256 = %candidate.fingerprint_hex(),
            trusted = outcome.is_ok(),
            "peer certificate chain evaluated"
        );
        let mut state = self.state.lock();
        state.candidate = Some(candidate);
        state.outcome = Some(outcome.clone());
    }

    fn on_bad_certificate(&self, error: &CertificateError) -> BadCertificateDecision {
        warn!(
            code = error.code(),
            %error,
            "certificate rejected by engine; deferring decision until handshake completes"
        );
        self.state.lock().bad_certificate = Some(error.clone());
        BadCertificateDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn identity_follows_end_entity_fingerprint() {
        let a = CertificateRecord::new(&b"cert-a"[..]);
        let a_with_chain =
            CertificateRecord::from_chain(b"cert-a", [&b"intermediate"[..]].into_iter());
        let b = CertificateRecord::new(&b"cert-b"[..]);
        assert!(a.same_identity(&a_with_chain));
        assert!(!a.same_identity(&b));
        assert_eq!(a.fingerprint_hex().len(), 64);
        assert_eq!(a_with_chain.intermediates().len(), 1);
    }

    #[test]
    fn untouched_validator_reports_inherited() {
        let validator = CertificateValidator::new();
        assert_eq!(validator.verdict(), CertificateVerdict::Inherited);
        assert!(validator.candidate().is_none());
    }

    #[test]
    fn trusted_chain_is_recorded() {
        let validator = CertificateValidator::new();
        validator.on_auth_certificate(CertificateRecord::new(&b"leaf"[..]), &Ok(()));
        assert_eq!(validator.verdict(), CertificateVerdict::Trusted);
        assert_eq!(
            validator.candidate().map(|c| c.der().to_vec()),
            Some(b"leaf".to_vec())
        );
        validator.reset();
        assert_eq!(validator.verdict(), CertificateVerdict::Inherited);
    }

    #[traced_test]
    #[test]
    fn bad_certificate_is_recorded_and_handshake_continues() {
        let validator = CertificateValidator::new();
        let failure = Err(CertificateError::UnknownIssuer);
        validator.on_auth_certificate(CertificateRecord::new(&b"self-signed"[..]), &failure);
        let decision = validator.on_bad_certificate(&CertificateError::UnknownIssuer);

        assert_eq!(decision, BadCertificateDecision::Continue);
        assert_eq!(
            validator.verdict(),
            CertificateVerdict::Failed(CertificateError::UnknownIssuer)
        );
        assert!(logs_contain("deferring decision until handshake completes"));
    }
}
