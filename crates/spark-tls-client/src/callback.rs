use std::fmt;

use bytes::Bytes;

use crate::{
    error::{Direction, SessionError},
    session::HandshakeOutcome,
};

/// `connect` 的结果：握手结论，或导致会话终止的错误。
pub type ConnectResult = Result<HandshakeOutcome, SessionError>;
pub type ReadResult = Result<Bytes, SessionError>;
pub type WriteResult = Result<usize, SessionError>;

pub(crate) type Notifier<T> = Box<dyn FnOnce(T) + 'static>;

/// 单个方向上的挂起操作：调用方缓冲区（或其描述）与完成通知。
pub(crate) struct PendingOperation<B, T> {
    buffer: B,
    notifier: Notifier<T>,
}

/// 延迟派发的通知集合。
///
/// 会话在持有内部借用时只负责“收集”通知，释放借用之后再统一调用，
/// 因此回调内部可以安全地重新进入会话（例如在读回调里发起下一次读）。
#[must_use = "notifications must be dispatched after the session borrow is released"]
#[derive(Default)]
pub(crate) struct Notifications(Vec<Box<dyn FnOnce() + 'static>>);

impl Notifications {
    pub(crate) fn push(&mut self, notification: Option<Box<dyn FnOnce() + 'static>>) {
        self.0.extend(notification);
    }

    pub(crate) fn extend(&mut self, other: Notifications) {
        self.0.extend(other.0);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn dispatch(self) {
        for notification in self.0 {
            notification();
        }
    }
}

/// 每个方向最多一个挂起操作的回调管理器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 调用方的读写缓冲区与完成通知必须跨越“返回 Pending → 传输完成”的时间窗存活；
/// - 以 `Option` 表达“该方向是否有挂起操作”，重复发起直接以契约错误拒绝。
///
/// ## 契约（What）
/// - `install_*`：方向已被占用时返回 [`SessionError::OperationPending`]；
/// - `complete_*`：摘下通知并与结果配对成延迟通知，保证每个通知至多调用一次；
/// - `discard`：同步完成时丢弃通知，值直接返回给调用方；
/// - `fail_all`：以同一错误的克隆终结全部挂起操作。
#[derive(Default)]
pub(crate) struct CallbackManager {
    connect: Option<PendingOperation<(), ConnectResult>>,
    read: Option<PendingOperation<usize, ReadResult>>,
    write: Option<PendingOperation<Bytes, WriteResult>>,
}

impl CallbackManager {
    pub(crate) fn install_connect(
        &mut self,
        notifier: Notifier<ConnectResult>,
    ) -> Result<(), SessionError> {
        install(&mut self.connect, Direction::Connect, (), notifier)
    }

    pub(crate) fn install_read(
        &mut self,
        max_len: usize,
        notifier: Notifier<ReadResult>,
    ) -> Result<(), SessionError> {
        install(&mut self.read, Direction::Read, max_len, notifier)
    }

    pub(crate) fn install_write(
        &mut self,
        data: Bytes,
        notifier: Notifier<WriteResult>,
    ) -> Result<(), SessionError> {
        install(&mut self.write, Direction::Write, data, notifier)
    }

    pub(crate) fn has(&self, direction: Direction) -> bool {
        match direction {
            Direction::Connect => self.connect.is_some(),
            Direction::Read => self.read.is_some(),
            Direction::Write => self.write.is_some(),
        }
    }

    pub(crate) fn any(&self) -> bool {
        self.connect.is_some() || self.read.is_some() || self.write.is_some()
    }

    /// 挂起读请求的最大长度。
    pub(crate) fn read_len(&self) -> Option<usize> {
        self.read.as_ref().map(|op| op.buffer)
    }

    /// 挂起写请求的数据（`Bytes` 克隆只增加引用计数）。
    pub(crate) fn write_data(&self) -> Option<Bytes> {
        self.write.as_ref().map(|op| op.buffer.clone())
    }

    pub(crate) fn complete_connect(
        &mut self,
        result: ConnectResult,
    ) -> Option<Box<dyn FnOnce() + 'static>> {
        complete(&mut self.connect, result)
    }

    pub(crate) fn complete_read(
        &mut self,
        result: ReadResult,
    ) -> Option<Box<dyn FnOnce() + 'static>> {
        complete(&mut self.read, result)
    }

    pub(crate) fn complete_write(
        &mut self,
        result: WriteResult,
    ) -> Option<Box<dyn FnOnce() + 'static>> {
        complete(&mut self.write, result)
    }

    pub(crate) fn discard(&mut self, direction: Direction) {
        match direction {
            Direction::Connect => drop(self.connect.take()),
            Direction::Read => drop(self.read.take()),
            Direction::Write => drop(self.write.take()),
        }
    }

    pub(crate) fn fail_all(&mut self, error: &SessionError) -> Notifications {
        let mut notifications = Notifications::default();
        notifications.push(self.complete_connect(Err(error.clone())));
        notifications.push(self.complete_write(Err(error.clone())));
        notifications.push(self.complete_read(Err(error.clone())));
        notifications
    }
}

impl fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackManager")
            .field("connect", &self.connect.is_some())
            .field("read", &self.read_len())
            .field("write", &self.write.as_ref().map(|op| op.buffer.len()))
            .finish()
    }
}

fn install<B, T>(
    slot: &mut Option<PendingOperation<B, T>>,
    direction: Direction,
    buffer: B,
    notifier: Notifier<T>,
) -> Result<(), SessionError> {
    if slot.is_some() {
        return Err(SessionError::OperationPending(direction));
    }
    *slot = Some(PendingOperation { buffer, notifier });
    Ok(())
}

fn complete<B, T: 'static>(
    slot: &mut Option<PendingOperation<B, T>>,
    value: T,
) -> Option<Box<dyn FnOnce() + 'static>> {
    let notifier = slot.take()?.notifier;
    Some(Box::new(move || notifier(value)))
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    #[test]
    fn second_operation_in_same_direction_is_rejected() {
        let mut callbacks = CallbackManager::default();
        callbacks
            .install_read(16, Box::new(|_| {}))
            .expect("first read installs");
        let err = callbacks
            .install_read(8, Box::new(|_| {}))
            .expect_err("second read must be rejected");
        assert!(matches!(err, SessionError::OperationPending(Direction::Read)));
        assert_eq!(callbacks.read_len(), Some(16));

        callbacks
            .install_write(Bytes::from_static(b"x"), Box::new(|_| {}))
            .expect("directions are independent");
    }

    #[test]
    fn completion_is_deferred_and_fires_once() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = CallbackManager::default();
        let sink = Rc::clone(&seen);
        callbacks
            .install_write(
                Bytes::from_static(b"payload"),
                Box::new(move |result: WriteResult| {
                    sink.borrow_mut().push(result.expect("ok"))
                }),
            )
            .expect("installs");

        let notification = callbacks.complete_write(Ok(7));
        assert!(seen.borrow().is_empty(), "nothing runs before dispatch");
        assert!(!callbacks.has(Direction::Write));
        assert!(callbacks.complete_write(Ok(1)).is_none());

        let mut notifications = Notifications::default();
        notifications.push(notification);
        notifications.dispatch();
        assert_eq!(*seen.borrow(), vec![7]);
    }

    #[test]
    fn fail_all_reaches_every_pending_direction() {
        let failures = Rc::new(RefCell::new(0));
        let mut callbacks = CallbackManager::default();
        let (a, b) = (Rc::clone(&failures), Rc::clone(&failures));
        callbacks
            .install_read(
                4,
                Box::new(move |r: ReadResult| *a.borrow_mut() += r.is_err() as u32),
            )
            .expect("installs");
        callbacks
            .install_write(
                Bytes::new(),
                Box::new(move |r: WriteResult| *b.borrow_mut() += r.is_err() as u32),
            )
            .expect("installs");

        let notifications = callbacks.fail_all(&SessionError::Disconnected);
        assert_eq!(notifications.len(), 2);
        assert!(!callbacks.any());
        notifications.dispatch();
        assert_eq!(*failures.borrow(), 2);
    }

    #[test]
    fn discard_drops_without_calling() {
        let called = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&called);
        let mut callbacks = CallbackManager::default();
        callbacks
            .install_connect(Box::new(move |_| *flag.borrow_mut() = true))
            .expect("installs");
        callbacks.discard(Direction::Connect);
        assert!(!callbacks.has(Direction::Connect));
        assert!(!*called.borrow());
    }
}
