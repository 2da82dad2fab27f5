//! 测试替身 (fakes shared by the unit tests)

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use image::RgbImage;
use once_cell::sync::Lazy;

use crate::detection::Detection;
use crate::error::{AnalyzerError, Result};
use crate::models::{DepthEstimator, DetectionBackend, SharedDepthEstimator};
use crate::pipeline::{FrameSource, Subscriber, UpstreamSession, VideoFrame};

static REGISTRY_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialises tests that touch the process-wide backend registry.
pub fn registry_guard() -> MutexGuard<'static, ()> {
    REGISTRY_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ========== 检测 / 深度 ==========

pub struct FakeDetector {
    detections: Vec<Detection>,
    error: Option<String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            error: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl DetectionBackend for FakeDetector {
    fn predict(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match &self.error {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(self.detections.clone()),
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

pub struct FakeDepth {
    distance: f32,
}

impl FakeDepth {
    pub fn constant(distance: f32) -> Self {
        Self { distance }
    }

    pub fn shared(distance: f32) -> SharedDepthEstimator {
        let boxed: Box<dyn DepthEstimator> = Box::new(Self::constant(distance));
        Arc::new(Mutex::new(boxed))
    }
}

impl DepthEstimator for FakeDepth {
    fn model_type(&self) -> &str {
        "fake"
    }

    fn estimate_distance_m(&mut self, _frame: &RgbImage, detections: &[Detection]) -> anyhow::Result<Vec<f32>> {
        Ok(vec![self.distance; detections.len()])
    }
}

// ========== 上游 ==========

/// What every source handed out by a [`FakeSession`] does on `recv`.
#[derive(Debug, Clone, Copy)]
pub enum SourceMode {
    /// A 64x48 frame every `interval`
    Frames(Duration),
    Timeouts,
    Closed,
}

#[derive(Default)]
struct StatsInner {
    connects: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct SessionStats {
    inner: Arc<StatsInner>,
}

impl SessionStats {
    /// Connect attempts, successful or not
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

pub struct FakeSession {
    stats: SessionStats,
    mode: SourceMode,
    max_connects: Option<usize>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            stats: SessionStats::default(),
            mode: SourceMode::Frames(Duration::from_millis(2)),
            max_connects: None,
        }
    }

    pub fn with_mode(mut self, mode: SourceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Connect attempts beyond `n` fail.
    pub fn fail_connects_after(mut self, n: usize) -> Self {
        self.max_connects = Some(n);
        self
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }
}

impl UpstreamSession for FakeSession {
    fn connect(&mut self) -> anyhow::Result<Box<dyn FrameSource>> {
        let attempt = self.stats.inner.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_connects.is_some_and(|max| attempt > max) {
            anyhow::bail!("peer refused connection");
        }
        Ok(Box::new(FakeSource { mode: self.mode }))
    }

    fn close(&mut self) {
        self.stats.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeSource {
    mode: SourceMode,
}

impl FrameSource for FakeSource {
    fn recv(&mut self, timeout: Duration) -> Result<VideoFrame> {
        match self.mode {
            SourceMode::Frames(interval) => {
                std::thread::sleep(interval);
                Ok(VideoFrame::from_rgb(RgbImage::new(64, 48)))
            }
            SourceMode::Timeouts => {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Err(AnalyzerError::FrameTimeout)
            }
            SourceMode::Closed => Err(AnalyzerError::SourceClosed("end of stream".to_string())),
        }
    }
}

// ========== 订阅者 ==========

#[derive(Default)]
pub struct RecordingSubscriber {
    messages: Mutex<Vec<String>>,
    fail: AtomicBool,
    closed: AtomicBool,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Subscriber for RecordingSubscriber {
    fn send(&self, message: &str) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset");
        }
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.to_string());
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
