//! 帧流水线编排 (Frame pipeline orchestrator)
//!
//! 两个线程:
//! - 接收循环: 取帧 → 计帧/FPS → 自适应缩放 → 投递推理 → 清理过期轨迹 (无任务在途时)
//! - 推理线程: detect → depth → track → 清理过期轨迹 → 构造消息 → 广播
//!
//! 两者之间是容量为 1 的工作槽; 槽被占用时新帧直接丢弃, 不排队。
//! 第一个订阅者加入时启动, 最后一个离开时停止; 连续错误达到上限时整体重连。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use tracing::{debug, error, info, trace, warn};

use super::adaptive::{resize_frame, AdaptiveController};
use super::frame::VideoFrame;
use super::inference::{lock_tracker, FrameJob, InferenceStep, SharedTracker};
use super::message::{ControlMessage, MessageBuilder};
use super::source::{FrameSource, UpstreamSession};
use super::subscriber::{Subscriber, SubscriberId, SubscriberSet};
use crate::config::AnalyzerConfig;
use crate::detection::TrackingManager;
use crate::error::{AnalyzerError, Result};
use crate::models::{get_depth_estimator, get_detector, Detector, SharedDepthEstimator};

/// 墙钟时间 (秒)
fn wall_clock_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// 分片睡眠, 取消时提前返回
fn sleep_unless_cancelled(cancel: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

// ========== 工作槽 ==========

/// 容量为 1 的推理工作槽
///
/// `try_submit` 在上一帧仍在推理时返回 `false`, 帧被丢弃。
pub struct WorkSlot {
    tx: Sender<FrameJob>,
    busy: Arc<AtomicBool>,
}

/// 推理线程一侧
pub struct WorkReceiver {
    rx: Receiver<FrameJob>,
    busy: Arc<AtomicBool>,
}

pub fn work_slot() -> (WorkSlot, WorkReceiver) {
    let (tx, rx) = bounded(1);
    let busy = Arc::new(AtomicBool::new(false));
    (
        WorkSlot {
            tx,
            busy: busy.clone(),
        },
        WorkReceiver { rx, busy },
    )
}

impl WorkSlot {
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn try_submit(&self, job: FrameJob) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::Release);
                false
            }
        }
    }
}

impl WorkReceiver {
    /// 阻塞等待下一个任务; 发送端关闭后返回 `None`
    pub fn recv(&self) -> Option<FrameJob> {
        self.rx.recv().ok()
    }

    /// 当前任务处理完毕
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

// ========== 共享状态 ==========

struct Shared {
    config: AnalyzerConfig,
    subscribers: SubscriberSet,
    detector: Arc<Detector>,
    depth: SharedDepthEstimator,
    tracker: SharedTracker,
    session: Mutex<Box<dyn UpstreamSession>>,
    last_error: Mutex<Option<AnalyzerError>>,
    /// 接收循环是否仍在服务订阅者; 订阅者增删与循环退出都在此锁下判断
    live: Mutex<bool>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Box<dyn UpstreamSession>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live(&self) -> MutexGuard<'_, bool> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 没有订阅者时标记循环退出
    fn keep_serving(&self) -> bool {
        let mut live = self.live();
        if self.subscribers.is_empty() {
            *live = false;
            return false;
        }
        true
    }

    fn connect(&self) -> Result<Box<dyn FrameSource>> {
        self.session().connect().map_err(AnalyzerError::Reconnect)
    }

    fn close_subscribers(&self) {
        for subscriber in self.subscribers.drain() {
            if let Err(e) = subscriber.close() {
                debug!(error = %e, "ignoring subscriber close error");
            }
        }
    }
}

struct RunHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// 单次运行的可变状态, 归接收循环独占
struct ProcessingState {
    frame_id: u64,
    adaptive: AdaptiveController,
    consecutive_errors: u32,
    source: Box<dyn FrameSource>,
    /// 最近一次 FPS 结算时的墙钟时间 (秒)
    last_fps_wall: f64,
    dropped: u64,
    /// 在途推理任务的帧号
    in_flight: Option<u64>,
    /// 上一次推理期间经过的帧数
    inference_lag: u64,
}

impl ProcessingState {
    fn new(config: &AnalyzerConfig, source: Box<dyn FrameSource>) -> Self {
        Self {
            frame_id: 0,
            adaptive: AdaptiveController::new(config.adaptive.clone(), Instant::now()),
            consecutive_errors: 0,
            source,
            last_fps_wall: wall_clock_secs(),
            dropped: 0,
            in_flight: None,
            inference_lag: 0,
        }
    }

    /// 工作槽空闲后结算在途任务跨过的帧数
    fn observe_slot(&mut self, busy: bool) {
        if busy {
            return;
        }
        if let Some(submitted) = self.in_flight.take() {
            self.inference_lag = self.frame_id.saturating_sub(submitted + 1);
        }
    }

    /// 接收循环清理过期轨迹用的帧号
    ///
    /// 有任务在途时返回 `None`, 由推理线程按任务帧号清理;
    /// 否则扣除上一次推理的耗时帧数, 与同步检测时的帧号对齐。
    fn prune_frame_id(&self) -> Option<u64> {
        match self.in_flight {
            Some(_) => None,
            None => Some(self.frame_id.saturating_sub(self.inference_lag)),
        }
    }
}

// ========== FramePipeline ==========

/// 一个上游视频源的分析流水线
pub struct FramePipeline {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
}

impl FramePipeline {
    pub fn new(
        config: AnalyzerConfig,
        session: Box<dyn UpstreamSession>,
        detector: Arc<Detector>,
        depth: SharedDepthEstimator,
    ) -> Self {
        let tracker = Arc::new(Mutex::new(TrackingManager::new(config.tracker.clone())));
        Self {
            shared: Arc::new(Shared {
                config,
                subscribers: SubscriberSet::new(),
                detector,
                depth,
                tracker,
                session: Mutex::new(session),
                last_error: Mutex::new(None),
                live: Mutex::new(false),
            }),
            run: Mutex::new(None),
        }
    }

    /// 通过注册表解析检测器与深度估计器
    pub fn from_config(config: AnalyzerConfig, session: Box<dyn UpstreamSession>) -> Result<Self> {
        config.validate()?;
        let detector = get_detector(&config.detector, None)?;
        let depth = get_depth_estimator(&config.depth, None)?;
        info!(
            detector = %detector.backend_name(),
            depth_backend = %config.depth.backend,
            "pipeline backends resolved"
        );
        Ok(Self::new(config, session, detector, depth))
    }

    fn run_handle(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 加入订阅者; 流水线未运行时启动
    pub fn attach(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let mut run = self.run_handle();
        let (id, count, serving) = {
            let mut live = self.shared.live();
            let (id, count) = self.shared.subscribers.insert(subscriber);
            let serving = *live && run.as_ref().is_some_and(|r| !r.thread.is_finished());
            *live = true;
            (id, count, serving)
        };
        info!(subscriber = id, subscribers = count, "subscriber attached");
        if !serving {
            self.start(&mut run);
        }
        id
    }

    /// 移除订阅者; 最后一个离开时停止
    pub fn detach(&self, id: SubscriberId) {
        let mut run = self.run_handle();
        let (existed, remaining) = self.shared.subscribers.remove(id);
        if existed {
            info!(subscriber = id, subscribers = remaining, "subscriber detached");
        }
        if remaining == 0 {
            self.stop_locked(&mut run);
        }
    }

    /// 处理订阅者发来的控制消息; 无法解析的消息被忽略
    pub fn handle_message(&self, id: SubscriberId, raw: &str) -> Result<()> {
        let message = match serde_json::from_str::<ControlMessage>(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(subscriber = id, error = %e, "ignoring malformed control message");
                return Ok(());
            }
        };

        if message != ControlMessage::Ping {
            return Ok(());
        }
        let Some(subscriber) = self.shared.subscribers.get(id) else {
            return Ok(());
        };

        let pong = serde_json::to_string(&ControlMessage::Pong)?;
        if let Err(e) = subscriber.send(&pong) {
            self.detach(id);
            return Err(AnalyzerError::Subscriber(format!("{e:#}")));
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.run_handle()
            .as_ref()
            .is_some_and(|run| !run.thread.is_finished())
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// 上一次运行因上游故障结束时的错误
    pub fn take_error(&self) -> Option<AnalyzerError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// 停止处理并关闭所有订阅者 (关闭错误被忽略)
    pub fn shutdown(&self) {
        self.stop();
        self.shared.close_subscribers();
        info!("pipeline shut down");
    }

    /// 启动新的一次运行; 调用方持有运行锁并已将 `live` 置位
    fn start(&self, run: &mut Option<RunHandle>) {
        // 回收已退出或正在退出的上一次运行
        if let Some(finished) = run.take() {
            if finished.thread.join().is_err() {
                error!("previous pipeline thread panicked");
            }
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let thread_cancel = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("pipeline-recv".to_string())
            .spawn(move || run_pipeline(shared, thread_cancel));

        match spawned {
            Ok(thread) => {
                info!("pipeline started");
                *run = Some(RunHandle { cancel, thread });
            }
            Err(e) => {
                error!(error = %e, "failed to spawn pipeline thread");
                *self.shared.live() = false;
            }
        }
    }

    fn stop(&self) {
        let mut run = self.run_handle();
        self.stop_locked(&mut run);
    }

    /// 取消并等待接收循环结束; 会话在循环线程内释放
    fn stop_locked(&self, run: &mut Option<RunHandle>) {
        if let Some(handle) = run.take() {
            handle.cancel.store(true, Ordering::Release);
            if handle.thread.join().is_err() {
                error!("pipeline thread panicked");
            }
            info!("pipeline stopped");
        }
        *self.shared.live() = false;
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ========== 线程主体 ==========

fn run_pipeline(shared: Arc<Shared>, cancel: Arc<AtomicBool>) {
    let (slot, work) = work_slot();

    let worker_shared = shared.clone();
    let worker_cancel = cancel.clone();
    let worker = std::thread::Builder::new()
        .name("pipeline-infer".to_string())
        .spawn(move || inference_worker(worker_shared, work, worker_cancel));
    let worker = match worker {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "failed to spawn inference thread");
            return;
        }
    };

    let mut connected = false;
    let result = receive_loop(&shared, &cancel, &slot, &mut connected);

    // 先等推理线程退出, 再释放上游
    if result.is_err() {
        cancel.store(true, Ordering::Release);
    }
    drop(slot);
    if worker.join().is_err() {
        error!("inference thread panicked");
    }

    if connected {
        shared.session().close();
    }
    lock_tracker(&shared.tracker).clear();

    match result {
        Ok(()) => info!("receive loop finished"),
        Err(e) => {
            error!(error = %e, "pipeline terminated by upstream failure");
            {
                let mut live = shared.live();
                *live = false;
                shared.close_subscribers();
            }
            *shared
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(e);
        }
    }
}

fn receive_loop(
    shared: &Shared,
    cancel: &AtomicBool,
    slot: &WorkSlot,
    connected: &mut bool,
) -> Result<()> {
    let settings = &shared.config.pipeline;
    let recv_timeout = Duration::from_millis(settings.recv_timeout_ms);
    let max_errors = settings.max_consecutive_errors.max(1);

    let source = shared.connect()?;
    *connected = true;
    let mut state = ProcessingState::new(&shared.config, source);

    while !cancel.load(Ordering::Acquire) && shared.keep_serving() {
        let timed_out = match state.source.recv(recv_timeout) {
            Ok(frame) => {
                state.consecutive_errors = 0;
                if let Err(e) = process_frame(shared, &mut state, slot, &frame) {
                    warn!(frame_id = state.frame_id, error = %e, "frame skipped");
                    sleep_unless_cancelled(cancel, Duration::from_millis(settings.error_backoff_ms));
                }
                continue;
            }
            Err(AnalyzerError::FrameTimeout) => {
                state.consecutive_errors += 1;
                warn!(
                    consecutive_errors = state.consecutive_errors,
                    timeout_ms = settings.recv_timeout_ms,
                    "frame receive timed out"
                );
                true
            }
            Err(e) => {
                state.consecutive_errors += 1;
                warn!(
                    consecutive_errors = state.consecutive_errors,
                    error = %e,
                    "frame receive failed"
                );
                false
            }
        };

        if state.consecutive_errors >= max_errors {
            info!(
                consecutive_errors = state.consecutive_errors,
                "upstream unstable, attempting full reconnect"
            );
            shared.session().close();
            *connected = false;
            sleep_unless_cancelled(cancel, Duration::from_millis(settings.reconnect_delay_ms));
            if cancel.load(Ordering::Acquire) {
                break;
            }
            state.source = shared.connect()?;
            *connected = true;
            state.consecutive_errors = 0;
            info!("upstream reconnected");
        }
        // 超时本身已经等待过
        if !timed_out {
            sleep_unless_cancelled(cancel, Duration::from_millis(settings.error_backoff_ms));
        }
    }

    debug!(
        frames = state.frame_id,
        dropped = state.dropped,
        "receive loop exiting"
    );
    Ok(())
}

fn process_frame(
    shared: &Shared,
    state: &mut ProcessingState,
    slot: &WorkSlot,
    frame: &VideoFrame,
) -> Result<()> {
    state.frame_id += 1;
    let captured_at = wall_clock_secs();
    if state.adaptive.record_frame(Instant::now()).is_some() {
        state.last_fps_wall = captured_at;
    }
    state.observe_slot(slot.is_busy());

    if state.adaptive.should_detect(state.frame_id) && !shared.subscribers.is_empty() {
        if state.in_flight.is_some() {
            state.dropped += 1;
            trace!(frame_id = state.frame_id, "inference busy, frame dropped");
        } else {
            let rgb = frame.to_rgb()?;
            let small = scale_frame(rgb, state.adaptive.scale())?;
            let job = FrameJob {
                frame_id: state.frame_id,
                frame: small,
                captured_at,
                fps_time: state.last_fps_wall,
                fps: state.adaptive.current_fps(),
            };
            if slot.try_submit(job) {
                state.in_flight = Some(state.frame_id);
            } else {
                state.dropped += 1;
            }
        }
    }

    if let Some(prune_at) = state.prune_frame_id() {
        let removed = lock_tracker(&shared.tracker).remove_stale_tracks(prune_at);
        if removed > 0 {
            debug!(frame_id = state.frame_id, prune_at, removed, "stale tracks removed");
        }
    }
    Ok(())
}

fn scale_frame(rgb: RgbImage, scale: f32) -> Result<RgbImage> {
    let resized = match resize_frame(&rgb, scale)? {
        std::borrow::Cow::Owned(image) => Some(image),
        std::borrow::Cow::Borrowed(_) => None,
    };
    Ok(resized.unwrap_or(rgb))
}

fn inference_worker(shared: Arc<Shared>, work: WorkReceiver, cancel: Arc<AtomicBool>) {
    let builder = MessageBuilder::new(
        shared.config.camera.clone(),
        shared.config.pipeline.fps_report_every,
    );
    let mut step = InferenceStep::new(
        shared.detector.clone(),
        shared.depth.clone(),
        shared.tracker.clone(),
        builder,
    );
    let backoff = Duration::from_millis(shared.config.pipeline.error_backoff_ms);

    while let Some(job) = work.recv() {
        let outcome = step.run(&job);

        // 已取消: 丢弃部分结果
        if cancel.load(Ordering::Acquire) {
            work.release();
            break;
        }

        match outcome {
            Ok(Some(message)) => match message.to_json() {
                Ok(json) => {
                    let report = shared.subscribers.broadcast(&json);
                    trace!(
                        frame_id = job.frame_id,
                        delivered = report.delivered,
                        removed = report.removed.len(),
                        "metadata broadcast"
                    );
                }
                Err(e) => warn!(frame_id = job.frame_id, error = %e, "metadata serialization failed"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(frame_id = job.frame_id, error = %e, "frame processing failed");
                sleep_unless_cancelled(&cancel, backoff);
            }
        }
        work.release();
    }
}
