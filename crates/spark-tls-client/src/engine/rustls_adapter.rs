use std::{
    borrow::Cow,
    cell::RefCell,
    io::{self, Read, Write},
    sync::{Arc, OnceLock},
};

use arc_swap::ArcSwap;
use rustls::{
    AlertDescription, ClientConfig, ClientConnection, DigitallySignedStruct, Error as RustlsError,
    HandshakeKind, ProtocolVersion, RootCertStore, SignatureScheme, SupportedProtocolVersion,
    client::{
        ClientSessionMemoryCache, ClientSessionStore, Resumption, WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tracing::debug;

use crate::{
    bridge::MemoryBridge,
    cache::SessionCache,
    certificate::{BadCertificateDecision, CertificateHooks, CertificateRecord},
    config::{TlsClientConfig, TlsVersion},
    engine::{NegotiatedParams, TlsEngine},
    error::{CertificateError, ConfigError, EngineError},
    session::TlsClientSession,
    transport::Transport,
};

/// 进程级的一次性初始化：构造 aws-lc-rs 密码学提供者，并尝试登记为进程默认值。
///
/// 首个会话构造前由 [`TlsConnector::new`] 惰性调用；重复调用只返回缓存的提供者。
pub fn ensure_initialized() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| {
            let provider = rustls::crypto::aws_lc_rs::default_provider();
            if provider.clone().install_default().is_err() {
                debug!("process-wide rustls crypto provider was already installed");
            }
            Arc::new(provider)
        })
        .clone()
}

#[derive(Debug)]
struct ConnectorState {
    config: TlsClientConfig,
    client_config: Arc<ClientConfig>,
    tickets: Arc<ClientSessionMemoryCache>,
}

impl ConnectorState {
    fn build(config: TlsClientConfig, roots: RootCertStore) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut provider = (*ensure_initialized()).clone();
        if !config.disabled_cipher_suites.is_empty() {
            provider.cipher_suites.retain(|suite| {
                !config
                    .disabled_cipher_suites
                    .contains(&u16::from(suite.suite()))
            });
            if provider.cipher_suites.is_empty() {
                return Err(ConfigError::NoCipherSuites);
            }
        }
        let provider = Arc::new(provider);

        let versions: Vec<&'static SupportedProtocolVersion> =
            config.versions().map(protocol_version).collect();
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .map_err(|err| ConfigError::Engine(err.to_string()))?;

        // rustls 只在校验器为同一 `Arc` 时复用会话，因此整个连接器共享一个软失败校验器。
        let mut client_config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)
            .map_err(|err| ConfigError::Engine(err.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SoftFailVerifier { inner: verifier }))
            .with_no_client_auth();
        client_config.alpn_protocols = config
            .alpn_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect();

        let tickets = Arc::new(ClientSessionMemoryCache::new(
            config.session_cache_capacity,
        ));
        client_config.resumption = if config.enable_resumption {
            Resumption::store(Arc::clone(&tickets) as Arc<dyn ClientSessionStore>)
        } else {
            Resumption::disabled()
        };

        Ok(Self {
            config,
            client_config: Arc::new(client_config),
            tickets,
        })
    }
}

fn protocol_version(version: TlsVersion) -> &'static SupportedProtocolVersion {
    match version {
        TlsVersion::Tls12 => &rustls::version::TLS12,
        TlsVersion::Tls13 => &rustls::version::TLS13,
    }
}

/// 基于 rustls 的 TLS 客户端会话工厂。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 集中持有协商配置、根证书校验器与跨会话共享的票据存储，使同一主机的后续连接可以复用会话；
/// - 通过 [`ArcSwap`] 支持在不影响既有会话的前提下替换配置（例如轮换根证书）。
///
/// ## 逻辑（How）
/// 1. `new` 校验配置，按版本上下界与禁用套件裁剪密码学提供者，构造基础 `ClientConfig`；
/// 2. `session` 读取当前快照，为每个会话创建独立的 [`RustlsEngine`]；
///    各会话的证书钩子只在握手推进期间挂到共享的软失败校验器上；
/// 3. 证书基线缓存 [`SessionCache`] 在配置替换前后保持不变。
///
/// ## 契约（What）
/// - `replace_config`：原子替换配置，仅影响之后创建的会话；旧票据随旧配置一并丢弃；
/// - `config_snapshot`：返回当前配置副本。
#[derive(Clone, Debug)]
pub struct TlsConnector {
    state: Arc<ArcSwap<ConnectorState>>,
    cache: Arc<SessionCache>,
}

impl TlsConnector {
    pub fn new(config: TlsClientConfig, roots: RootCertStore) -> Result<Self, ConfigError> {
        let state = ConnectorState::build(config, roots)?;
        let cache = Arc::new(SessionCache::new(state.config.session_cache_capacity));
        Ok(Self {
            state: Arc::new(ArcSwap::from_pointee(state)),
            cache,
        })
    }

    pub fn replace_config(
        &self,
        config: TlsClientConfig,
        roots: RootCertStore,
    ) -> Result<(), ConfigError> {
        let state = ConnectorState::build(config, roots)?;
        self.state.store(Arc::new(state));
        Ok(())
    }

    pub fn config_snapshot(&self) -> TlsClientConfig {
        self.state.load().config.clone()
    }

    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// 为指定主机创建独立的 rustls 引擎。
    pub fn engine(&self, hostname: &str) -> Result<RustlsEngine, ConfigError> {
        RustlsEngine::new(&self.state.load(), hostname)
    }

    /// 在给定传输之上创建 TLS 客户端会话；传输可以已连接，也可以尚未连接。
    pub fn session(
        &self,
        transport: Box<dyn Transport>,
        hostname: &str,
    ) -> Result<TlsClientSession, ConfigError> {
        let state = self.state.load_full();
        let engine = RustlsEngine::new(&state, hostname)?;
        Ok(TlsClientSession::new(
            transport,
            hostname,
            &state.config,
            Box::new(engine),
            Arc::clone(&self.cache),
        ))
    }
}

/// rustls 引擎适配器：以 [`MemoryBridge`] 充当 rustls 的“套接字”。
#[derive(Debug)]
pub struct RustlsEngine {
    base: Arc<ClientConfig>,
    tickets: Arc<ClientSessionMemoryCache>,
    server_name: ServerName<'static>,
    hooks: Option<Arc<dyn CertificateHooks>>,
    allow_resumption: bool,
    /// 会话已被作废：握手后才到达的 TLS 1.3 票据同样要丢弃。
    invalidated: bool,
    conn: Option<ClientConnection>,
}

impl RustlsEngine {
    fn new(state: &ConnectorState, hostname: &str) -> Result<Self, ConfigError> {
        let server_name = ServerName::try_from(hostname.to_owned())
            .map_err(|_| ConfigError::ServerName(hostname.to_owned()))?;
        Ok(Self {
            base: Arc::clone(&state.client_config),
            tickets: Arc::clone(&state.tickets),
            server_name,
            hooks: None,
            allow_resumption: true,
            invalidated: false,
            conn: None,
        })
    }

    fn build_connection(&self) -> Result<ClientConnection, EngineError> {
        let config = if self.allow_resumption {
            Arc::clone(&self.base)
        } else {
            let mut config = (*self.base).clone();
            config.resumption = Resumption::disabled();
            Arc::new(config)
        };
        ClientConnection::new(config, self.server_name.clone()).map_err(map_rustls_error)
    }

    fn connection(&mut self) -> Result<&mut ClientConnection, EngineError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.build_connection()?,
        };
        Ok(self.conn.insert(conn))
    }

    fn flush_tls(conn: &mut ClientConnection, bridge: &mut MemoryBridge) -> Result<(), EngineError> {
        while conn.wants_write() {
            match conn.write_tls(bridge) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(EngineError::Protocol(Cow::Owned(err.to_string()))),
            }
        }
        Ok(())
    }

    fn forget_tickets(&self) {
        self.tickets.remove_tls12_session(&self.server_name);
        while self.tickets.take_tls13_ticket(&self.server_name).is_some() {}
    }

    /// 从桥接拉取密文并交给 rustls 处理；返回是否读到了传输层 EOF。
    fn pull_tls(conn: &mut ClientConnection, bridge: &mut MemoryBridge) -> Result<bool, EngineError> {
        while conn.wants_read() {
            match conn.read_tls(bridge) {
                Ok(0) => return Ok(true),
                Ok(_) => {
                    if let Err(err) = conn.process_new_packets() {
                        // 尽力把告警送出，连接此后不可用。
                        let _ = Self::flush_tls(conn, bridge);
                        return Err(map_rustls_error(err));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(EngineError::Protocol(Cow::Owned(err.to_string()))),
            }
        }
        Ok(false)
    }
}

impl TlsEngine for RustlsEngine {
    fn register_certificate_hooks(&mut self, hooks: Arc<dyn CertificateHooks>) {
        self.hooks = Some(hooks);
    }

    fn handshake(&mut self, bridge: &mut MemoryBridge) -> Result<(), EngineError> {
        let _scope = HooksScope::enter(self.hooks.clone());
        let conn = self.connection()?;
        Self::flush_tls(conn, bridge)?;
        let eof = Self::pull_tls(conn, bridge)?;
        Self::flush_tls(conn, bridge)?;
        if !conn.is_handshaking() {
            return Ok(());
        }
        if eof {
            return Err(EngineError::Closed);
        }
        Err(EngineError::WouldBlock)
    }

    fn write_payload(
        &mut self,
        bridge: &mut MemoryBridge,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        let conn = self.connection()?;
        if conn.is_handshaking() {
            return Err(EngineError::Protocol(Cow::Borrowed(
                "payload write before handshake completion",
            )));
        }
        Self::flush_tls(conn, bridge)?;
        let accepted = conn
            .writer()
            .write(data)
            .map_err(|err| EngineError::Protocol(Cow::Owned(err.to_string())))?;
        Self::flush_tls(conn, bridge)?;
        if accepted == 0 && !data.is_empty() {
            return Err(EngineError::WouldBlock);
        }
        Ok(accepted)
    }

    fn read_payload(
        &mut self,
        bridge: &mut MemoryBridge,
        out: &mut [u8],
    ) -> Result<usize, EngineError> {
        let conn = self.connection()?;
        let eof = Self::pull_tls(conn, bridge)?;
        Self::flush_tls(conn, bridge)?;
        let read = conn.reader().read(out);
        if self.invalidated {
            self.forget_tickets();
        }
        match read {
            Ok(read) => Ok(read),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if eof || bridge.is_closed() {
                    Err(EngineError::Closed)
                } else {
                    Err(EngineError::WouldBlock)
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(EngineError::Closed),
            Err(err) => Err(EngineError::Protocol(Cow::Owned(err.to_string()))),
        }
    }

    fn peer_certificate(&self) -> Option<CertificateRecord> {
        let chain = self.conn.as_ref()?.peer_certificates()?;
        let (end_entity, intermediates) = chain.split_first()?;
        Some(CertificateRecord::from_chain(
            end_entity.as_ref(),
            intermediates.iter().map(|cert| cert.as_ref()),
        ))
    }

    fn is_resumed(&self) -> bool {
        self.conn.as_ref().and_then(|conn| conn.handshake_kind()) == Some(HandshakeKind::Resumed)
    }

    fn negotiated(&self) -> Option<NegotiatedParams> {
        let conn = self.conn.as_ref()?;
        if conn.is_handshaking() {
            return None;
        }
        Some(NegotiatedParams {
            version: conn.protocol_version().and_then(|version| match version {
                ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
                ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
                _ => None,
            }),
            cipher_suite: conn
                .negotiated_cipher_suite()
                .map(|suite| u16::from(suite.suite())),
            alpn_protocol: conn.alpn_protocol().map(<[u8]>::to_vec),
        })
    }

    fn invalidate_session(&mut self) {
        self.invalidated = true;
        self.forget_tickets();
        debug!(server_name = ?self.server_name, "resumable tls session invalidated");
    }

    fn restart(&mut self, allow_resumption: bool) -> Result<(), EngineError> {
        self.conn = None;
        self.allow_resumption = allow_resumption;
        self.invalidated = false;
        Ok(())
    }

    fn flush(&mut self, bridge: &mut MemoryBridge) -> Result<(), EngineError> {
        match self.conn.as_mut() {
            Some(conn) => Self::flush_tls(conn, bridge),
            None => Ok(()),
        }
    }

    fn close(&mut self, bridge: &mut MemoryBridge) {
        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
            let _ = Self::flush_tls(conn, bridge);
        }
    }
}

thread_local! {
    static ACTIVE_HOOKS: RefCell<Option<Arc<dyn CertificateHooks>>> = const { RefCell::new(None) };
}

/// 在当前线程上挂载会话的证书钩子，离开作用域时恢复先前的值。
///
/// rustls 只在 `process_new_packets` 内同步调用校验器，而引擎只在 `handshake` 内推进握手，
/// 因此作用域覆盖整个 `handshake` 调用即可。
struct HooksScope(Option<Arc<dyn CertificateHooks>>);

impl HooksScope {
    fn enter(hooks: Option<Arc<dyn CertificateHooks>>) -> Self {
        Self(ACTIVE_HOOKS.replace(hooks))
    }
}

impl Drop for HooksScope {
    fn drop(&mut self) {
        ACTIVE_HOOKS.set(self.0.take());
    }
}

/// 软失败校验器：先由 WebPKI 完成真实校验，再把结论交给当前挂载的证书钩子裁决。
///
/// 没有挂载钩子时退化为普通的 WebPKI 校验。
#[derive(Debug)]
struct SoftFailVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SoftFailVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let verified =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        let Some(hooks) = ACTIVE_HOOKS.with_borrow(Clone::clone) else {
            return verified;
        };
        let candidate = CertificateRecord::from_chain(
            end_entity.as_ref(),
            intermediates.iter().map(|cert| cert.as_ref()),
        );
        let outcome = match &verified {
            Ok(_) => Ok(()),
            Err(err) => Err(certificate_error_from_rustls(err)),
        };
        hooks.on_auth_certificate(candidate, &outcome);

        match (verified, outcome) {
            (Ok(verified), _) => Ok(verified),
            (Err(err), Err(error)) => match hooks.on_bad_certificate(&error) {
                BadCertificateDecision::Continue => Ok(ServerCertVerified::assertion()),
                BadCertificateDecision::Reject => Err(err),
            },
            (Err(err), Ok(())) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn certificate_error_from_rustls(error: &RustlsError) -> CertificateError {
    match error {
        RustlsError::InvalidCertificate(cert) => map_certificate_error(cert),
        RustlsError::NoCertificatesPresented => CertificateError::Missing,
        other => CertificateError::Other(Cow::Owned(other.to_string())),
    }
}

fn map_certificate_error(error: &rustls::CertificateError) -> CertificateError {
    use rustls::CertificateError as Cert;
    match error {
        Cert::UnknownIssuer => CertificateError::UnknownIssuer,
        Cert::Expired | Cert::ExpiredContext { .. } => CertificateError::Expired,
        Cert::NotValidYet | Cert::NotValidYetContext { .. } => CertificateError::NotYetValid,
        Cert::NotValidForName | Cert::NotValidForNameContext { .. } => {
            CertificateError::NameMismatch
        }
        Cert::Revoked => CertificateError::Revoked,
        Cert::BadSignature => CertificateError::BadSignature,
        // 吊销列表过期不代表证书本身过期。
        other => CertificateError::Other(Cow::Owned(other.to_string())),
    }
}

/// 将 rustls 错误归类为引擎错误：证书、协议违规或握手失败。
fn map_rustls_error(error: RustlsError) -> EngineError {
    use RustlsError::*;
    match &error {
        InvalidCertificate(_) | NoCertificatesPresented => {
            EngineError::Certificate(certificate_error_from_rustls(&error))
        }
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | PeerSentOversizedRecord => EngineError::Protocol(Cow::Owned(error.to_string())),
        AlertReceived(alert) => alert_to_engine_error(*alert, &error),
        _ => EngineError::Handshake(Cow::Owned(error.to_string())),
    }
}

fn alert_to_engine_error(alert: AlertDescription, error: &RustlsError) -> EngineError {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | CertificateRequired => EngineError::Certificate(CertificateError::Other(Cow::Owned(
            error.to_string(),
        ))),
        DecodeError | RecordOverflow | BadRecordMac | UnexpectedMessage | DecryptError => {
            EngineError::Protocol(Cow::Owned(error.to_string()))
        }
        _ => EngineError::Handshake(Cow::Owned(error.to_string())),
    }
}
