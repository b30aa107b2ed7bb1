//! 集成测试共享的脚本化传输与脚本化引擎。
//!
//! - `MockHandle`/`MockTransport`：读写与连接既可同步完成，也可挂起后由测试显式交付；
//!   同时统计重叠的传输读写次数，用于验证“每个方向至多一个未完成操作”；
//! - `ScriptedEngine`：极简的“伪 TLS”。客户端先发 `HELLO`，服务端回
//!   `SRV | kind | len(u16) | cert`，客户端再发 `FIN`；载荷按原样透传，便于断言字节数。
#![allow(dead_code)]

use std::{
    cell::RefCell,
    io::{self, Read, Write},
    mem,
    rc::Rc,
    sync::Arc,
    task::Poll,
};

use bytes::{Buf, Bytes, BytesMut};
use spark_tls_client::{
    BadCertificateDecision, CertificateError, CertificateHooks, CertificateRecord, EngineError,
    IoCallback, MemoryBridge, SessionCache, TlsClientConfig, TlsClientSession, TlsEngine,
    Transport,
};

pub const CLIENT_HELLO: &[u8] = b"HELLO";
pub const CLIENT_FIN: &[u8] = b"FIN";
pub const HOST: &str = "origin.spark.test";

/// 服务端首轮报文的类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flight {
    Full,
    Resumed,
}

pub fn server_flight(kind: Flight, cert: &[u8]) -> Vec<u8> {
    let mut flight = b"SRV".to_vec();
    flight.push(match kind {
        Flight::Full => b'F',
        Flight::Resumed => b'R',
    });
    flight.extend_from_slice(&(cert.len() as u16).to_be_bytes());
    flight.extend_from_slice(cert);
    flight
}

#[derive(Default)]
pub struct TransportState {
    pub connected: bool,
    pub async_connect: bool,
    pub sync_writes: bool,
    pub sync_reads: bool,
    pending_connect: Option<IoCallback<()>>,
    pending_read: Option<(usize, IoCallback<Bytes>)>,
    pending_write: Option<(Bytes, IoCallback<usize>)>,
    stale_reads: Vec<IoCallback<Bytes>>,
    inbound: BytesMut,
    inbound_closed: bool,
    pub written: BytesMut,
    pub connects: usize,
    pub disconnects: usize,
    pub overlapping_reads: usize,
    pub overlapping_writes: usize,
}

/// 测试侧持有的传输句柄；回调总是在释放内部借用之后调用。
#[derive(Clone, Default)]
pub struct MockHandle(Rc<RefCell<TransportState>>);

impl MockHandle {
    /// 已连接、写同步完成、读挂起的传输。
    pub fn connected() -> Self {
        let handle = Self::default();
        handle.with(|state| {
            state.connected = true;
            state.sync_writes = true;
        });
        handle
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport(self.clone()))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut TransportState) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    pub fn deliver(&self, data: &[u8]) {
        self.with(|state| state.inbound.extend_from_slice(data));
        self.pump_reads();
    }

    /// 对端有序关闭：挂起的读收到零字节。
    pub fn close(&self) {
        self.with(|state| state.inbound_closed = true);
        self.pump_reads();
    }

    fn pump_reads(&self) {
        loop {
            let next = self.with(|state| {
                if state.inbound.is_empty() && !state.inbound_closed {
                    return None;
                }
                let (max_len, on_complete) = state.pending_read.take()?;
                let len = max_len.min(state.inbound.len());
                Some((on_complete, state.inbound.split_to(len).freeze()))
            });
            match next {
                Some((on_complete, data)) => on_complete(Ok(data)),
                None => return,
            }
        }
    }

    pub fn fail_read(&self, kind: io::ErrorKind) {
        if let Some((_, on_complete)) = self.with(|state| state.pending_read.take()) {
            on_complete(Err(kind.into()));
        }
    }

    pub fn complete_writes(&self) {
        while let Some((data, on_complete)) = self.with(|state| {
            let (data, on_complete) = state.pending_write.take()?;
            state.written.extend_from_slice(&data);
            Some((data, on_complete))
        }) {
            on_complete(Ok(data.len()));
        }
    }

    pub fn complete_connect(&self) {
        let pending = self.with(|state| {
            state.connected = true;
            state.pending_connect.take()
        });
        if let Some(on_complete) = pending {
            on_complete(Ok(()));
        }
    }

    /// 触发断开前遗留的读回调，模拟迟到的传输完成。
    pub fn fire_stale_reads(&self, data: &[u8]) -> usize {
        let stale = self.with(|state| mem::take(&mut state.stale_reads));
        let count = stale.len();
        for on_complete in stale {
            on_complete(Ok(Bytes::copy_from_slice(data)));
        }
        count
    }

    pub fn take_written(&self) -> Bytes {
        self.with(|state| state.written.split().freeze())
    }

    pub fn has_pending_read(&self) -> bool {
        self.with(|state| state.pending_read.is_some())
    }

    pub fn has_pending_write(&self) -> bool {
        self.with(|state| state.pending_write.is_some())
    }
}

pub struct MockTransport(MockHandle);

impl Transport for MockTransport {
    fn connect(&mut self, on_complete: IoCallback<()>) -> Poll<io::Result<()>> {
        self.0.with(|state| {
            state.connects += 1;
            if state.async_connect {
                state.pending_connect = Some(on_complete);
                return Poll::Pending;
            }
            state.connected = true;
            Poll::Ready(Ok(()))
        })
    }

    fn read(&mut self, max_len: usize, on_complete: IoCallback<Bytes>) -> Poll<io::Result<Bytes>> {
        self.0.with(|state| {
            if state.pending_read.is_some() {
                state.overlapping_reads += 1;
            }
            if !state.connected {
                return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
            }
            if state.sync_reads && (!state.inbound.is_empty() || state.inbound_closed) {
                let len = max_len.min(state.inbound.len());
                return Poll::Ready(Ok(state.inbound.split_to(len).freeze()));
            }
            state.pending_read = Some((max_len, on_complete));
            Poll::Pending
        })
    }

    fn write(&mut self, data: Bytes, on_complete: IoCallback<usize>) -> Poll<io::Result<usize>> {
        self.0.with(|state| {
            if state.pending_write.is_some() {
                state.overlapping_writes += 1;
            }
            if !state.connected {
                return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
            }
            if state.sync_writes {
                state.written.extend_from_slice(&data);
                return Poll::Ready(Ok(data.len()));
            }
            state.pending_write = Some((data, on_complete));
            Poll::Pending
        })
    }

    fn disconnect(&mut self) {
        self.0.with(|state| {
            state.connected = false;
            state.disconnects += 1;
            state.pending_connect = None;
            if let Some((_, on_complete)) = state.pending_read.take() {
                state.stale_reads.push(on_complete);
            }
            state.pending_write = None;
            state.inbound.clear();
            state.inbound_closed = false;
        });
    }

    fn is_connected(&self) -> bool {
        self.0.with(|state| state.connected)
    }
}

/// 脚本化引擎的可观测副作用。
#[derive(Debug, Default)]
pub struct EngineProbe {
    pub handshakes: usize,
    pub invalidations: usize,
    pub restarts: Vec<bool>,
}

pub struct ScriptedEngine {
    trusted: Vec<Vec<u8>>,
    reject_untrusted: bool,
    hooks: Option<Arc<dyn CertificateHooks>>,
    hello_sent: bool,
    done: bool,
    inbox: BytesMut,
    peer: Option<CertificateRecord>,
    resumed: bool,
    probe: Rc<RefCell<EngineProbe>>,
}

impl ScriptedEngine {
    pub fn new(trusted: &[&[u8]]) -> (Self, Rc<RefCell<EngineProbe>>) {
        let probe = Rc::new(RefCell::new(EngineProbe::default()));
        let engine = Self {
            trusted: trusted.iter().map(|cert| cert.to_vec()).collect(),
            reject_untrusted: false,
            hooks: None,
            hello_sent: false,
            done: false,
            inbox: BytesMut::new(),
            peer: None,
            resumed: false,
            probe: Rc::clone(&probe),
        };
        (engine, probe)
    }

    pub fn rejecting_untrusted(mut self) -> Self {
        self.reject_untrusted = true;
        self
    }

    /// 从桥接搬运全部已到达密文；返回是否读到 EOF。
    fn fill(&mut self, bridge: &mut MemoryBridge) -> bool {
        let mut chunk = [0u8; 1024];
        loop {
            match bridge.read(&mut chunk) {
                Ok(0) => return true,
                Ok(read) => self.inbox.extend_from_slice(&chunk[..read]),
                Err(_) => return false,
            }
        }
    }

    fn verify(&self, record: &CertificateRecord) -> Result<(), EngineError> {
        let Some(hooks) = &self.hooks else {
            return Ok(());
        };
        let outcome = if self.trusted.iter().any(|cert| cert == record.der()) {
            Ok(())
        } else {
            Err(CertificateError::UnknownIssuer)
        };
        hooks.on_auth_certificate(record.clone(), &outcome);
        if let Err(error) = outcome {
            let decision = hooks.on_bad_certificate(&error);
            if decision == BadCertificateDecision::Reject || self.reject_untrusted {
                return Err(EngineError::Certificate(error));
            }
        }
        Ok(())
    }
}

impl TlsEngine for ScriptedEngine {
    fn register_certificate_hooks(&mut self, hooks: Arc<dyn CertificateHooks>) {
        self.hooks = Some(hooks);
    }

    fn handshake(&mut self, bridge: &mut MemoryBridge) -> Result<(), EngineError> {
        if self.done {
            return Ok(());
        }
        if !self.hello_sent {
            bridge
                .write_all(CLIENT_HELLO)
                .map_err(|_| EngineError::WouldBlock)?;
            self.hello_sent = true;
        }
        let eof = self.fill(bridge);
        let header = 6;
        let ready = self.inbox.len() >= header && {
            let len = u16::from_be_bytes([self.inbox[4], self.inbox[5]]) as usize;
            self.inbox.len() >= header + len
        };
        if !ready {
            return Err(if eof {
                EngineError::Closed
            } else {
                EngineError::WouldBlock
            });
        }
        if &self.inbox[..3] != b"SRV" {
            return Err(EngineError::Protocol("unexpected server flight".into()));
        }
        let kind = self.inbox[3];
        let len = u16::from_be_bytes([self.inbox[4], self.inbox[5]]) as usize;
        self.inbox.advance(header);
        let record = CertificateRecord::new(self.inbox.split_to(len).freeze());

        self.resumed = kind == b'R';
        if !self.resumed {
            self.verify(&record)?;
        }
        self.peer = Some(record);
        bridge
            .write_all(CLIENT_FIN)
            .map_err(|_| EngineError::WouldBlock)?;
        self.done = true;
        self.probe.borrow_mut().handshakes += 1;
        Ok(())
    }

    fn write_payload(
        &mut self,
        bridge: &mut MemoryBridge,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        bridge.write(data).map_err(|_| EngineError::WouldBlock)
    }

    fn read_payload(
        &mut self,
        bridge: &mut MemoryBridge,
        out: &mut [u8],
    ) -> Result<usize, EngineError> {
        let eof = self.fill(bridge);
        if self.inbox.is_empty() {
            return if eof { Ok(0) } else { Err(EngineError::WouldBlock) };
        }
        let len = out.len().min(self.inbox.len());
        out[..len].copy_from_slice(&self.inbox[..len]);
        self.inbox.advance(len);
        Ok(len)
    }

    fn peer_certificate(&self) -> Option<CertificateRecord> {
        self.peer.clone()
    }

    fn is_resumed(&self) -> bool {
        self.resumed
    }

    fn negotiated(&self) -> Option<spark_tls_client::NegotiatedParams> {
        self.done.then(Default::default)
    }

    fn invalidate_session(&mut self) {
        self.probe.borrow_mut().invalidations += 1;
    }

    fn restart(&mut self, allow_resumption: bool) -> Result<(), EngineError> {
        self.probe.borrow_mut().restarts.push(allow_resumption);
        self.hello_sent = false;
        self.done = false;
        self.inbox.clear();
        self.peer = None;
        self.resumed = false;
        Ok(())
    }
}

/// 一个会话及其全部测试替身。
pub struct Harness {
    pub session: Rc<TlsClientSession>,
    pub transport: MockHandle,
    pub probe: Rc<RefCell<EngineProbe>>,
    pub cache: Arc<SessionCache>,
}

impl Harness {
    pub fn new(transport: MockHandle, trusted: &[&[u8]], cache: Arc<SessionCache>) -> Self {
        Self::with_config(transport, trusted, cache, &TlsClientConfig::default())
    }

    pub fn with_config(
        transport: MockHandle,
        trusted: &[&[u8]],
        cache: Arc<SessionCache>,
        config: &TlsClientConfig,
    ) -> Self {
        let (engine, probe) = ScriptedEngine::new(trusted);
        let session = TlsClientSession::new(
            transport.transport(),
            HOST,
            config,
            Box::new(engine),
            Arc::clone(&cache),
        );
        Self {
            session: Rc::new(session),
            transport,
            probe,
            cache,
        }
    }
}

/// 记录回调结果的收集器。
pub fn recorder<T: 'static>() -> (Rc<RefCell<Vec<T>>>, impl FnOnce(T) + 'static) {
    let log: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    (log, move |value: T| sink.borrow_mut().push(value))
}
