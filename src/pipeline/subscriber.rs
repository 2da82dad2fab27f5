//! 订阅者集合 (Subscriber fan-out)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::AnalyzerError;

pub type SubscriberId = u64;

/// 下游订阅者 (如 WebSocket 连接)
///
/// `send` 失败表示对端已断开, 该订阅者会在本轮广播结束后被移除。
pub trait Subscriber: Send + Sync {
    fn send(&self, message: &str) -> anyhow::Result<()>;

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// crossbeam 通道订阅者
///
/// 队列满时丢弃本条消息, 接收端断开视为发送失败。
pub struct ChannelSubscriber {
    tx: Sender<String>,
    closed: AtomicBool,
}

impl ChannelSubscriber {
    pub fn new(tx: Sender<String>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }
}

impl Subscriber for ChannelSubscriber {
    fn send(&self, message: &str) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("subscriber closed");
        }
        match self.tx.try_send(message.to_string()) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => anyhow::bail!("receiver dropped"),
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// 一次广播的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<SubscriberId>,
}

#[derive(Default)]
struct SetInner {
    next_id: SubscriberId,
    members: BTreeMap<SubscriberId, Arc<dyn Subscriber>>,
}

/// 活跃订阅者集合
///
/// 只在 attach/detach 时修改; 广播时先拷贝快照, 迭代结束后再移除失败者。
#[derive(Default)]
pub struct SubscriberSet {
    inner: Mutex<SetInner>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SetInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 加入, 返回 (ID, 加入后的数量)
    pub fn insert(&self, subscriber: Arc<dyn Subscriber>) -> (SubscriberId, usize) {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.members.insert(id, subscriber);
        (id, inner.members.len())
    }

    /// 移除, 返回 (是否存在, 剩余数量)
    pub fn remove(&self, id: SubscriberId) -> (bool, usize) {
        let mut inner = self.lock();
        let existed = inner.members.remove(&id).is_some();
        (existed, inner.members.len())
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<dyn Subscriber>> {
        self.lock().members.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(SubscriberId, Arc<dyn Subscriber>)> {
        self.lock()
            .members
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }

    /// 取出全部订阅者 (关闭时使用)
    pub fn drain(&self) -> Vec<Arc<dyn Subscriber>> {
        std::mem::take(&mut self.lock().members).into_values().collect()
    }

    /// 广播给快照中的每个订阅者, 失败者在迭代结束后移除
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (id, subscriber) in self.snapshot() {
            match subscriber.send(message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    let err = AnalyzerError::Subscriber(format!("{e:#}"));
                    warn!(subscriber = id, error = %err, "dropping subscriber after failed send");
                    report.removed.push(id);
                }
            }
        }

        if !report.removed.is_empty() {
            let mut inner = self.lock();
            for id in &report.removed {
                inner.members.remove(id);
            }
            debug!(remaining = inner.members.len(), "subscriber set pruned");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSubscriber;
    use crossbeam_channel::bounded;

    #[test]
    fn test_failed_subscriber_removed_others_still_served() {
        let set = SubscriberSet::new();
        let good = Arc::new(RecordingSubscriber::new());
        let bad = Arc::new(RecordingSubscriber::new());
        bad.fail_sends(true);

        let (good_id, _) = set.insert(good.clone());
        let (bad_id, n) = set.insert(bad.clone());
        assert_eq!(n, 2);

        let report = set.broadcast("hello");
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec![bad_id]);
        assert_eq!(set.len(), 1);
        assert!(set.get(good_id).is_some());
        assert_eq!(good.messages(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_ids_are_unique() {
        let set = SubscriberSet::new();
        let (a, _) = set.insert(Arc::new(RecordingSubscriber::new()));
        set.remove(a);
        let (b, _) = set.insert(Arc::new(RecordingSubscriber::new()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_remove_reports_remaining() {
        let set = SubscriberSet::new();
        let (a, _) = set.insert(Arc::new(RecordingSubscriber::new()));
        assert_eq!(set.remove(a), (true, 0));
        assert_eq!(set.remove(a), (false, 0));
    }

    #[test]
    fn test_channel_subscriber() {
        let (tx, rx) = bounded(1);
        let sub = ChannelSubscriber::new(tx);
        sub.send("a").unwrap();
        // full queue drops silently
        sub.send("b").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "a");
        drop(rx);
        assert!(sub.send("c").is_err());
    }
}
