use std::{
    borrow::Cow,
    cell::RefCell,
    fmt, io, mem,
    rc::{Rc, Weak},
    sync::Arc,
    task::Poll,
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::{
    bridge::MemoryBridge,
    cache::SessionCache,
    callback::{CallbackManager, ConnectResult, Notifications, Notifier, ReadResult, WriteResult},
    certificate::{CertificateHooks, CertificateRecord, CertificateValidator, CertificateVerdict},
    config::TlsClientConfig,
    engine::{NegotiatedParams, TlsEngine},
    error::{CertificateError, Direction, EngineError, SessionError},
    state::{State, Step},
    transport::{IoCallback, Transport},
};

/// 单次载荷读为调用方分配的最大明文缓冲。
const MAX_READ_CHUNK: usize = 64 * 1024;

/// 握手完成时交付给 `connect` 调用方的结论。
///
/// 软失败策略下，证书问题不会中止握手，而是体现在 `certificate` 字段里；
/// 需要“证书失败即失败”语义的调用方使用 [`HandshakeOutcome::into_result`]。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// 本次握手复用了先前的会话。
    pub resumed: bool,
    /// 因复用会话的证书发生变化而强制进行过一次完整握手。
    pub restarted: bool,
    pub certificate: CertificateVerdict,
}

impl HandshakeOutcome {
    pub fn certificate_error(&self) -> Option<&CertificateError> {
        self.certificate.error()
    }

    /// 把软失败的证书错误折叠为硬错误。
    pub fn into_result(self) -> Result<Self, SessionError> {
        match &self.certificate {
            CertificateVerdict::Failed(error) => Err(SessionError::Certificate(error.clone())),
            _ => Ok(self),
        }
    }
}

/// 连接的安全信息快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SslInfo {
    pub certificate: Option<CertificateRecord>,
    pub certificate_error: Option<CertificateError>,
    pub negotiated: Option<NegotiatedParams>,
    pub resumed: bool,
}

enum CertificateCheck {
    Verdict(CertificateVerdict),
    Restart,
}

/// 非阻塞 TLS 客户端会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在“立即完成或稍后回调”的非阻塞传输之上，驱动一个按阻塞套接字形状工作的 TLS 引擎；
/// - 对调用方呈现统一的 `connect`/`read`/`write`：同步完成时直接返回 `Poll::Ready`，
///   否则返回 `Poll::Pending`，并在之后恰好调用一次对应的完成回调。
///
/// ## 逻辑（How）
/// 1. 引擎只读写 [`MemoryBridge`]；每执行一步状态机，会话就“抽送”一次网络：
///    先把待发送密文交给传输层，再为接收侧发起一次传输读，两个方向各自最多一个未完成操作；
/// 2. 步骤返回 [`Step`]：`Suspend` 时若网络在本轮同步推进过则继续循环，否则停驻并返回 Pending；
/// 3. 每个传输完成回调都带有发起时的纪元号（epoch），重启或断开后旧纪元的完成一律忽略；
/// 4. 完成回调先更新桥接，再依次恢复连接、写、读三个方向的挂起循环；
/// 5. 握手结束后比对证书：复用会话若换了证书，作废会话缓存并在新的传输连接上强制完整握手（至多一次）。
///
/// ## 契约（What）
/// - 同一方向同时只允许一个挂起操作，重复发起返回 [`SessionError::OperationPending`]；
/// - 载荷读写要求握手已完成，否则返回 [`SessionError::HandshakeIncomplete`]；
/// - 致命错误被保存，此后的操作以其克隆快速失败，握手不会被再次尝试；
/// - 读到零字节：握手中为 [`SessionError::ConnectionClosed`]，握手后为空 `Bytes`（流结束）；
/// - `disconnect` 以 [`SessionError::Disconnected`] 终结所有挂起操作；直接丢弃会话则不调用任何回调。
///
/// ## 风险与权衡（Trade-offs）
/// - 会话基于 `Rc<RefCell<..>>`，是 `!Send` 的，必须在单一 I/O 上下文中驱动；
/// - 回调总是在释放内部借用之后才派发，因此允许在回调里重新进入会话；
///   反之，传输层绝不能在 `read`/`write`/`connect` 调用内部同步触发完成回调。
pub struct TlsClientSession {
    core: Rc<RefCell<SessionCore>>,
    hostname: String,
}

impl TlsClientSession {
    pub fn new(
        transport: Box<dyn Transport>,
        hostname: &str,
        config: &TlsClientConfig,
        mut engine: Box<dyn TlsEngine>,
        cache: Arc<SessionCache>,
    ) -> Self {
        let validator = Arc::new(CertificateValidator::new());
        engine.register_certificate_hooks(Arc::clone(&validator) as Arc<dyn CertificateHooks>);

        let core = Rc::new_cyclic(|this| {
            RefCell::new(SessionCore {
                this: this.clone(),
                hostname: hostname.to_owned(),
                transport,
                engine,
                bridge: MemoryBridge::new(config.recv_buffer_size, config.send_buffer_size),
                validator,
                cache,
                callbacks: CallbackManager::default(),
                next_state: State::None,
                completed_handshake: false,
                restarted: false,
                link_up: false,
                connecting: false,
                server_cert: None,
                outcome: None,
                failure: None,
                disconnected: false,
                epoch: 0,
            })
        });
        Self {
            core,
            hostname: hostname.to_owned(),
        }
    }

    /// 发起（或等待）TLS 握手。
    ///
    /// 握手已完成时直接返回上一次的结论；传输尚未连接时先建立传输连接。
    pub fn connect(
        &self,
        on_complete: impl FnOnce(ConnectResult) + 'static,
    ) -> Poll<ConnectResult> {
        let (poll, notifications) = self.core.borrow_mut().connect(Box::new(on_complete));
        notifications.dispatch();
        poll
    }

    /// 读取至多 `max_len` 字节明文；空 `Bytes` 表示流结束。
    pub fn read(
        &self,
        max_len: usize,
        on_complete: impl FnOnce(ReadResult) + 'static,
    ) -> Poll<ReadResult> {
        let (poll, notifications) = self
            .core
            .borrow_mut()
            .read(max_len, Box::new(on_complete));
        notifications.dispatch();
        poll
    }

    /// 加密并写出 `data`，返回被接受的明文字节数。
    pub fn write(
        &self,
        data: impl Into<Bytes>,
        on_complete: impl FnOnce(WriteResult) + 'static,
    ) -> Poll<WriteResult> {
        let (poll, notifications) = self
            .core
            .borrow_mut()
            .write(data.into(), Box::new(on_complete));
        notifications.dispatch();
        poll
    }

    pub fn disconnect(&self) {
        let notifications = self.core.borrow_mut().disconnect();
        notifications.dispatch();
    }

    pub fn is_connected(&self) -> bool {
        self.core.borrow().is_connected()
    }

    /// 已连接且没有尚未被读取的已到达数据。
    pub fn is_connected_and_idle(&self) -> bool {
        let core = self.core.borrow();
        core.is_connected()
            && core.transport.is_connected_and_idle()
            && core.bridge.buffered_recv() == 0
    }

    /// 最近一次握手中对端出示的证书。
    pub fn certificate_info(&self) -> Option<CertificateRecord> {
        self.core.borrow().server_cert.clone()
    }

    pub fn ssl_info(&self) -> SslInfo {
        let core = self.core.borrow();
        SslInfo {
            certificate: core.server_cert.clone(),
            certificate_error: core
                .outcome
                .as_ref()
                .and_then(HandshakeOutcome::certificate_error)
                .cloned(),
            negotiated: core.engine.negotiated(),
            resumed: core.outcome.as_ref().is_some_and(|outcome| outcome.resumed),
        }
    }

    pub fn state(&self) -> State {
        self.core.borrow().next_state
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl fmt::Debug for TlsClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TlsClientSession");
        debug.field("hostname", &self.hostname);
        if let Ok(core) = self.core.try_borrow() {
            debug
                .field("state", &core.next_state)
                .field("completed_handshake", &core.completed_handshake)
                .field("callbacks", &core.callbacks);
        }
        debug.finish_non_exhaustive()
    }
}

impl Drop for TlsClientSession {
    fn drop(&mut self) {
        let callbacks = match self.core.try_borrow_mut() {
            Ok(mut core) => core.teardown(),
            Err(_) => return,
        };
        // 挂起的通知在借用释放后静默丢弃。
        drop(callbacks);
    }
}

struct SessionCore {
    this: Weak<RefCell<SessionCore>>,
    hostname: String,
    transport: Box<dyn Transport>,
    engine: Box<dyn TlsEngine>,
    bridge: MemoryBridge,
    validator: Arc<CertificateValidator>,
    cache: Arc<SessionCache>,
    callbacks: CallbackManager,
    next_state: State,
    completed_handshake: bool,
    restarted: bool,
    /// 传输连接已建立（本纪元内）。
    link_up: bool,
    /// 传输连接请求处于挂起状态。
    connecting: bool,
    server_cert: Option<CertificateRecord>,
    outcome: Option<HandshakeOutcome>,
    failure: Option<SessionError>,
    disconnected: bool,
    epoch: u64,
}

type StepFn<T> = fn(&mut SessionCore, State) -> Result<Step<T>, SessionError>;
type CompleteFn<T> =
    fn(&mut CallbackManager, Result<T, SessionError>) -> Option<Box<dyn FnOnce() + 'static>>;

impl SessionCore {
    fn connect(&mut self, notifier: Notifier<ConnectResult>) -> (Poll<ConnectResult>, Notifications) {
        if self.disconnected {
            return ready(Err(SessionError::NotConnected));
        }
        if let Some(error) = &self.failure {
            return ready(Err(error.clone()));
        }
        if self.completed_handshake
            && let Some(outcome) = &self.outcome
        {
            return ready(Ok(outcome.clone()));
        }
        if let Err(error) = self.callbacks.install_connect(notifier) {
            return ready(Err(error));
        }
        if self.next_state == State::None {
            debug!(host = %self.hostname, "starting tls handshake");
            self.next_state = State::TransportConnect;
        }
        let poll = self.do_handshake_loop();
        self.settle(Direction::Connect, poll)
    }

    fn read(&mut self, max_len: usize, notifier: Notifier<ReadResult>) -> (Poll<ReadResult>, Notifications) {
        if let Err(error) = self.payload_ready(Direction::Read) {
            return ready(Err(error));
        }
        if max_len == 0 {
            return ready(Ok(Bytes::new()));
        }
        if let Err(error) = self
            .callbacks
            .install_read(max_len.min(MAX_READ_CHUNK), notifier)
        {
            return ready(Err(error));
        }
        let poll = self.do_read_loop();
        self.settle(Direction::Read, poll)
    }

    fn write(&mut self, data: Bytes, notifier: Notifier<WriteResult>) -> (Poll<WriteResult>, Notifications) {
        if let Err(error) = self.payload_ready(Direction::Write) {
            return ready(Err(error));
        }
        if data.is_empty() {
            return ready(Ok(0));
        }
        if let Err(error) = self.callbacks.install_write(data, notifier) {
            return ready(Err(error));
        }
        let poll = self.do_write_loop();
        self.settle(Direction::Write, poll)
    }

    fn disconnect(&mut self) -> Notifications {
        if self.disconnected {
            return Notifications::default();
        }
        debug!(host = %self.hostname, state = %self.next_state, "disconnecting tls session");
        if self.link_up && self.completed_handshake && self.failure.is_none() {
            // close_notify 尽力而为：只在能同步交给传输层时送出。
            self.engine.close(&mut self.bridge);
            if let Err(error) = self.buffer_send() {
                trace!(host = %self.hostname, code = error.code(), "close_notify was not sent");
            }
        }
        self.disconnected = true;
        self.drop_link();
        self.next_state = State::None;
        self.callbacks.fail_all(&SessionError::Disconnected)
    }

    fn teardown(&mut self) -> CallbackManager {
        self.disconnected = true;
        self.drop_link();
        mem::take(&mut self.callbacks)
    }

    /// 作废当前纪元并断开传输：此前发起的传输完成都会被忽略。
    fn drop_link(&mut self) {
        self.epoch += 1;
        self.transport.disconnect();
        self.link_up = false;
        self.connecting = false;
        self.bridge.reset();
    }

    fn is_connected(&self) -> bool {
        self.completed_handshake
            && !self.disconnected
            && self.failure.is_none()
            && self.transport.is_connected()
    }

    fn payload_ready(&self, direction: Direction) -> Result<(), SessionError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        if self.disconnected {
            return Err(SessionError::NotConnected);
        }
        if !self.completed_handshake {
            return Err(SessionError::HandshakeIncomplete);
        }
        if self.callbacks.has(direction) {
            return Err(SessionError::OperationPending(direction));
        }
        Ok(())
    }

    /// 同步入口的收尾：同步完成则丢弃通知，随后推动其它方向的挂起循环。
    fn settle<T>(
        &mut self,
        direction: Direction,
        poll: Poll<Result<T, SessionError>>,
    ) -> (Poll<Result<T, SessionError>>, Notifications) {
        let mut notifications = Notifications::default();
        if let Poll::Ready(result) = &poll {
            self.callbacks.discard(direction);
            if let Err(error) = result {
                notifications.extend(self.fail(error.clone()));
            }
        }
        notifications.extend(self.resume(Some(direction)));
        (poll, notifications)
    }

    /// 按连接、写、读的顺序恢复挂起的循环。
    fn resume(&mut self, skip: Option<Direction>) -> Notifications {
        let mut notifications = Notifications::default();
        for direction in [Direction::Connect, Direction::Write, Direction::Read] {
            if Some(direction) == skip || !self.callbacks.has(direction) || self.failure.is_some() {
                continue;
            }
            let failure = match direction {
                Direction::Connect => {
                    let poll = self.do_handshake_loop();
                    self.deliver(poll, CallbackManager::complete_connect, &mut notifications)
                }
                Direction::Write => {
                    let poll = self.do_write_loop();
                    self.deliver(poll, CallbackManager::complete_write, &mut notifications)
                }
                Direction::Read => {
                    let poll = self.do_read_loop();
                    self.deliver(poll, CallbackManager::complete_read, &mut notifications)
                }
            };
            if let Some(error) = failure {
                notifications.extend(self.fail(error));
            }
        }
        notifications
    }

    fn deliver<T: 'static>(
        &mut self,
        poll: Poll<Result<T, SessionError>>,
        complete: CompleteFn<T>,
        notifications: &mut Notifications,
    ) -> Option<SessionError> {
        let Poll::Ready(result) = poll else {
            return None;
        };
        let failure = result.as_ref().err().cloned();
        notifications.push(complete(&mut self.callbacks, result));
        failure
    }

    /// 记录致命错误并终结所有挂起操作。
    fn fail(&mut self, error: SessionError) -> Notifications {
        if !error.is_fatal() {
            return Notifications::default();
        }
        if self.failure.is_none() {
            warn!(
                host = %self.hostname,
                state = %self.next_state,
                code = error.code(),
                %error,
                "tls client session failed"
            );
            self.failure = Some(error.clone());
            self.next_state = State::None;
        }
        self.callbacks.fail_all(&error)
    }

    fn do_handshake_loop(&mut self) -> Poll<ConnectResult> {
        let mut state = self.next_state;
        let poll = self.do_loop(&mut state, Self::do_handshake_step);
        self.next_state = state;
        poll
    }

    fn do_write_loop(&mut self) -> Poll<WriteResult> {
        let mut state = State::PayloadWrite;
        self.do_loop(&mut state, Self::do_payload_write)
    }

    fn do_read_loop(&mut self) -> Poll<ReadResult> {
        let mut state = State::PayloadRead;
        self.do_loop(&mut state, Self::do_payload_read)
    }

    /// 驱动循环：执行一步，抽送网络，再按 [`Step`] 分支。
    fn do_loop<T>(&mut self, state: &mut State, step: StepFn<T>) -> Poll<Result<T, SessionError>> {
        loop {
            let current = *state;
            let stepped = step(self, current);
            let pumped = self.pump_network();
            let next = match stepped {
                Ok(next) => next,
                Err(error) => return Poll::Ready(Err(error)),
            };
            let moved = match pumped {
                Ok(moved) => moved,
                Err(error) => return Poll::Ready(Err(error)),
            };
            match next {
                Step::Complete(value) => {
                    *state = State::None;
                    return Poll::Ready(Ok(value));
                }
                Step::Continue(to) => {
                    debug!(host = %self.hostname, from = %current, %to, "state transition");
                    *state = to;
                }
                Step::Suspend if moved => {}
                Step::Suspend => {
                    debug!(host = %self.hostname, state = %current, "waiting for transport");
                    return Poll::Pending;
                }
            }
        }
    }

    fn do_handshake_step(&mut self, state: State) -> Result<Step<HandshakeOutcome>, SessionError> {
        match state {
            State::TransportConnect => self.do_transport_connect(),
            State::HandshakeRead => self.do_handshake_read(),
            other => Err(SessionError::Protocol(Cow::Owned(format!(
                "handshake driven from unexpected state {other}"
            )))),
        }
    }

    fn do_transport_connect(&mut self) -> Result<Step<HandshakeOutcome>, SessionError> {
        if self.connecting {
            return Ok(Step::Suspend);
        }
        if self.link_up || self.transport.is_connected() {
            self.link_up = true;
            return Ok(Step::Continue(State::HandshakeRead));
        }
        let on_complete = self.io_callback(Self::on_connect_complete);
        match self.transport.connect(on_complete) {
            Poll::Ready(Ok(())) => {
                self.link_up = true;
                Ok(Step::Continue(State::HandshakeRead))
            }
            Poll::Ready(Err(error)) => Err(SessionError::transport("connect", error)),
            Poll::Pending => {
                self.connecting = true;
                Ok(Step::Suspend)
            }
        }
    }

    fn do_handshake_read(&mut self) -> Result<Step<HandshakeOutcome>, SessionError> {
        match self.engine.handshake(&mut self.bridge) {
            Ok(()) => self.finish_handshake(),
            Err(EngineError::WouldBlock) if self.peer_closed() => Err(SessionError::ConnectionClosed),
            Err(EngineError::WouldBlock) => Ok(Step::Suspend),
            Err(error) => Err(error.into_session_error()),
        }
    }

    fn do_payload_write(&mut self, _state: State) -> Result<Step<usize>, SessionError> {
        let Some(data) = self.callbacks.write_data() else {
            return Err(SessionError::Protocol(Cow::Borrowed(
                "payload write without a pending request",
            )));
        };
        match self.engine.write_payload(&mut self.bridge, &data) {
            Ok(written) => {
                trace!(host = %self.hostname, bytes = written, "payload accepted by tls engine");
                Ok(Step::Complete(written))
            }
            Err(EngineError::WouldBlock) => Ok(Step::Suspend),
            Err(error) => Err(error.into_session_error()),
        }
    }

    fn do_payload_read(&mut self, _state: State) -> Result<Step<Bytes>, SessionError> {
        let Some(max_len) = self.callbacks.read_len() else {
            return Err(SessionError::Protocol(Cow::Borrowed(
                "payload read without a pending request",
            )));
        };
        let mut buf = BytesMut::zeroed(max_len);
        match self.engine.read_payload(&mut self.bridge, &mut buf) {
            Ok(read) => {
                trace!(host = %self.hostname, bytes = read, "payload decrypted");
                buf.truncate(read);
                Ok(Step::Complete(buf.freeze()))
            }
            Err(EngineError::Closed) => Ok(Step::Complete(Bytes::new())),
            Err(EngineError::WouldBlock) if self.peer_closed() => Ok(Step::Complete(Bytes::new())),
            Err(EngineError::WouldBlock) => Ok(Step::Suspend),
            Err(error) => Err(error.into_session_error()),
        }
    }

    fn peer_closed(&self) -> bool {
        self.bridge.is_closed() && self.bridge.buffered_recv() == 0
    }

    fn finish_handshake(&mut self) -> Result<Step<HandshakeOutcome>, SessionError> {
        let previous = self.update_server_cert();
        let verdict = match self.invalidate_session_if_bad_certificate(previous) {
            CertificateCheck::Restart => return self.restart_handshake(),
            CertificateCheck::Verdict(verdict) => verdict,
        };

        self.completed_handshake = true;
        let outcome = HandshakeOutcome {
            resumed: self.engine.is_resumed(),
            restarted: self.restarted,
            certificate: verdict,
        };
        info!(
            host = %self.hostname,
            resumed = outcome.resumed,
            restarted = outcome.restarted,
            "tls handshake completed"
        );
        if let Some(error) = outcome.certificate_error() {
            warn!(
                host = %self.hostname,
                code = error.code(),
                %error,
                "handshake completed with an untrusted certificate"
            );
        }
        self.outcome = Some(outcome.clone());
        Ok(Step::Complete(outcome))
    }

    /// 以引擎给出的对端证书替换会话记录，返回旧记录。
    fn update_server_cert(&mut self) -> Option<CertificateRecord> {
        let current = self
            .engine
            .peer_certificate()
            .or_else(|| self.validator.candidate());
        mem::replace(&mut self.server_cert, current)
    }

    /// 汇总证书判定，并在失败或复用会话换证书时作废可恢复会话。
    fn invalidate_session_if_bad_certificate(
        &mut self,
        previous: Option<CertificateRecord>,
    ) -> CertificateCheck {
        let resumed = self.engine.is_resumed();
        let verdict = self.validator.verdict();

        if let CertificateVerdict::Failed(error) = &verdict {
            debug!(
                host = %self.hostname,
                code = error.code(),
                "invalidating resumable session after certificate failure"
            );
            self.engine.invalidate_session();
            self.cache.forget(&self.hostname);
            return CertificateCheck::Verdict(verdict);
        }

        let baseline = previous.or_else(|| self.cache.certificate(&self.hostname));
        let changed = match (&baseline, &self.server_cert) {
            (Some(baseline), Some(current)) => !baseline.same_identity(current),
            (Some(_), None) => true,
            (None, _) => false,
        };

        if changed {
            self.engine.invalidate_session();
            if resumed {
                self.cache.forget(&self.hostname);
                if !self.restarted {
                    return CertificateCheck::Restart;
                }
                return CertificateCheck::Verdict(CertificateVerdict::Failed(
                    CertificateError::ChangedOnResumption,
                ));
            }
            debug!(host = %self.hostname, "peer certificate replaced since the last full handshake");
        }

        if !resumed
            && verdict == CertificateVerdict::Trusted
            && let Some(certificate) = &self.server_cert
        {
            self.cache.remember(&self.hostname, certificate.clone());
        }
        CertificateCheck::Verdict(verdict)
    }

    /// 放弃复用会话，在新的传输连接上重新进行完整握手。
    fn restart_handshake(&mut self) -> Result<Step<HandshakeOutcome>, SessionError> {
        info!(
            host = %self.hostname,
            "peer certificate changed on resumption; forcing a full handshake"
        );
        self.restarted = true;
        self.drop_link();
        self.validator.reset();
        self.server_cert = None;
        self.engine
            .restart(false)
            .map_err(EngineError::into_session_error)?;
        Ok(Step::Continue(State::TransportConnect))
    }

    /// 抽送网络：先发后收，返回本轮是否有传输操作同步完成。
    fn pump_network(&mut self) -> Result<bool, SessionError> {
        if !self.link_up || self.disconnected {
            return Ok(false);
        }
        self.engine
            .flush(&mut self.bridge)
            .map_err(EngineError::into_session_error)?;
        let sent = self.buffer_send()?;
        let received = self.buffer_recv()?;
        Ok(sent || received)
    }

    fn buffer_send(&mut self) -> Result<bool, SessionError> {
        let Some(chunk) = self.bridge.write_params() else {
            return Ok(false);
        };
        let len = chunk.len();
        self.bridge.begin_send();
        let on_complete = self.io_callback(Self::on_send_complete);
        match self.transport.write(chunk, on_complete) {
            Poll::Ready(Ok(0)) => {
                self.bridge.abort_send();
                Err(SessionError::transport("write", io::ErrorKind::WriteZero.into()))
            }
            Poll::Ready(Ok(written)) => {
                trace!(host = %self.hostname, bytes = written, "transport write completed");
                self.bridge.put_write_result(written);
                Ok(true)
            }
            Poll::Ready(Err(error)) => {
                self.bridge.abort_send();
                Err(SessionError::transport("write", error))
            }
            Poll::Pending => {
                debug!(host = %self.hostname, bytes = len, "transport write pending");
                Ok(false)
            }
        }
    }

    fn buffer_recv(&mut self) -> Result<bool, SessionError> {
        let Some(max_len) = self.bridge.read_params() else {
            return Ok(false);
        };
        self.bridge.begin_recv();
        let on_complete = self.io_callback(Self::on_recv_complete);
        match self.transport.read(max_len, on_complete) {
            Poll::Ready(Ok(data)) => {
                trace!(host = %self.hostname, bytes = data.len(), "transport read completed");
                self.bridge.put_read_result(&data);
                Ok(true)
            }
            Poll::Ready(Err(error)) => {
                self.bridge.abort_recv();
                Err(SessionError::transport("read", error))
            }
            Poll::Pending => Ok(false),
        }
    }

    /// 为传输操作构造完成回调：弱引用会话并记下当前纪元。
    fn io_callback<T: 'static>(
        &self,
        handler: fn(&mut SessionCore, io::Result<T>) -> Result<(), SessionError>,
    ) -> IoCallback<T> {
        let session = self.this.clone();
        let epoch = self.epoch;
        Box::new(move |result| {
            let Some(core) = session.upgrade() else {
                return;
            };
            let notifications = {
                let mut core = core.borrow_mut();
                if core.epoch != epoch {
                    trace!(
                        host = %core.hostname,
                        stale = epoch,
                        current = core.epoch,
                        "ignoring stale transport completion"
                    );
                    return;
                }
                core.on_io_complete(handler, result)
            };
            notifications.dispatch();
        })
    }

    fn on_io_complete<T>(
        &mut self,
        handler: fn(&mut SessionCore, io::Result<T>) -> Result<(), SessionError>,
        result: io::Result<T>,
    ) -> Notifications {
        if let Err(error) = handler(self, result) {
            return self.fail(error);
        }
        if self.failure.is_some() {
            return Notifications::default();
        }
        if !self.callbacks.any() {
            return match self.pump_network() {
                Ok(_) => Notifications::default(),
                Err(error) => self.fail(error),
            };
        }
        self.resume(None)
    }

    fn on_connect_complete(&mut self, result: io::Result<()>) -> Result<(), SessionError> {
        self.connecting = false;
        result.map_err(|error| SessionError::transport("connect", error))?;
        debug!(host = %self.hostname, "transport connected");
        self.link_up = true;
        Ok(())
    }

    fn on_send_complete(&mut self, result: io::Result<usize>) -> Result<(), SessionError> {
        match result {
            Ok(0) => {
                self.bridge.abort_send();
                Err(SessionError::transport("write", io::ErrorKind::WriteZero.into()))
            }
            Ok(written) => {
                trace!(host = %self.hostname, bytes = written, "transport write completed");
                self.bridge.put_write_result(written);
                Ok(())
            }
            Err(error) => {
                self.bridge.abort_send();
                Err(SessionError::transport("write", error))
            }
        }
    }

    fn on_recv_complete(&mut self, result: io::Result<Bytes>) -> Result<(), SessionError> {
        match result {
            Ok(data) => {
                trace!(host = %self.hostname, bytes = data.len(), "transport read completed");
                self.bridge.put_read_result(&data);
                Ok(())
            }
            Err(error) => {
                self.bridge.abort_recv();
                Err(SessionError::transport("read", error))
            }
        }
    }
}

fn ready<T>(result: Result<T, SessionError>) -> (Poll<Result<T, SessionError>>, Notifications) {
    (Poll::Ready(result), Notifications::default())
}
