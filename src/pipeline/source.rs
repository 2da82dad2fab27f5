//! 上游帧源 (Upstream frame source collaborators)
//!
//! The transport handshake lives outside this crate; it hands the pipeline an
//! [`UpstreamSession`] that can produce a [`FrameSource`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use super::frame::VideoFrame;
use crate::error::{AnalyzerError, Result};

/// 帧源: 阻塞接收, 最多等待 `timeout`
///
/// 超时返回 `FrameTimeout`, 流结束或损坏返回 `SourceClosed`。
pub trait FrameSource: Send {
    fn recv(&mut self, timeout: Duration) -> Result<VideoFrame>;
}

/// 上游会话: 建立连接得到帧源, 关闭释放资源
pub trait UpstreamSession: Send {
    fn connect(&mut self) -> anyhow::Result<Box<dyn FrameSource>>;
    fn close(&mut self);
}

/// crossbeam 通道帧源 (解码线程 → 分析循环)
pub struct ChannelSource {
    rx: Receiver<VideoFrame>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<VideoFrame>) -> Self {
        Self { rx }
    }
}

impl FrameSource for ChannelSource {
    fn recv(&mut self, timeout: Duration) -> Result<VideoFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(AnalyzerError::FrameTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(AnalyzerError::SourceClosed("sender disconnected".to_string()))
            }
        }
    }
}

// ========== 引用计数共享会话 ==========

struct SharedInner {
    session: Box<dyn UpstreamSession>,
    refs: usize,
}

/// 多个消费者共享的上游会话
///
/// `acquire` 加一, 释放减一, 计数归零时才真正 `close()`。
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<SharedInner>>,
}

impl SharedSession {
    pub fn new(session: Box<dyn UpstreamSession>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedInner { session, refs: 0 })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 获取一个租约, 租约本身实现 `UpstreamSession`
    pub fn acquire(&self) -> SessionLease {
        self.retain();
        SessionLease {
            shared: self.clone(),
            held: true,
        }
    }

    pub fn ref_count(&self) -> usize {
        self.lock().refs
    }

    fn retain(&self) {
        let mut inner = self.lock();
        inner.refs += 1;
        debug!(refs = inner.refs, "upstream session acquired");
    }

    fn release(&self) {
        let mut inner = self.lock();
        inner.refs = inner.refs.saturating_sub(1);
        debug!(refs = inner.refs, "upstream session released");
        if inner.refs == 0 {
            info!("last consumer released upstream session, closing");
            inner.session.close();
        }
    }
}

/// 共享会话的一份引用
pub struct SessionLease {
    shared: SharedSession,
    held: bool,
}

impl UpstreamSession for SessionLease {
    fn connect(&mut self) -> anyhow::Result<Box<dyn FrameSource>> {
        if !self.held {
            self.shared.retain();
            self.held = true;
        }
        self.shared.lock().session.connect()
    }

    fn close(&mut self) {
        if self.held {
            self.held = false;
            self.shared.release();
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::PixelFormat;
    use crate::testing::FakeSession;
    use crossbeam_channel::bounded;

    #[test]
    fn test_channel_source_maps_errors() {
        let (tx, rx) = bounded(1);
        let mut source = ChannelSource::new(rx);
        assert!(matches!(
            source.recv(Duration::from_millis(5)),
            Err(AnalyzerError::FrameTimeout)
        ));
        tx.send(VideoFrame::new(1, 1, PixelFormat::Rgb8, vec![0; 3]))
            .unwrap();
        assert!(source.recv(Duration::from_millis(5)).is_ok());
        drop(tx);
        assert!(matches!(
            source.recv(Duration::from_millis(5)),
            Err(AnalyzerError::SourceClosed(_))
        ));
    }

    #[test]
    fn test_physical_close_only_at_zero() {
        let fake = FakeSession::new();
        let stats = fake.stats();
        let shared = SharedSession::new(Box::new(fake));

        let mut a = shared.acquire();
        let mut b = shared.acquire();
        assert_eq!(shared.ref_count(), 2);

        a.close();
        a.close();
        assert_eq!(shared.ref_count(), 1);
        assert_eq!(stats.closes(), 0);

        b.close();
        assert_eq!(shared.ref_count(), 0);
        assert_eq!(stats.closes(), 1);
    }

    #[test]
    fn test_reconnect_reacquires_and_drop_releases() {
        let fake = FakeSession::new();
        let stats = fake.stats();
        let shared = SharedSession::new(Box::new(fake));

        {
            let mut lease = shared.acquire();
            lease.close();
            assert!(lease.connect().is_ok());
            assert_eq!(shared.ref_count(), 1);
            assert_eq!(stats.connects(), 1);
        }
        assert_eq!(shared.ref_count(), 0);
        assert_eq!(stats.closes(), 2);
    }
}
