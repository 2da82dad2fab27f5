/// 模型统一接口与实现
///
/// # 架构说明
///
/// ## 检测后端 (DetectionBackend)
/// 同步、可能阻塞的 `predict(frame) -> Vec<Detection>`。
/// - **YOLOv8 (ONNX Runtime)**: letterbox → 推理 → 解码 + NMS, 文件 `yolov8.rs`
///
/// ## 深度估计 (DepthEstimator)
/// `estimate_distance_m(frame, detections) -> Vec<f32>`, 与输入检测一一对应。
/// - **MiDaS (ONNX Runtime)**: 逆深度图 + 区域/掩码采样, 文件 `midas.rs`
/// - 采样工具: `depth.rs`
///
/// ## Detector
/// 包装检测后端: 100ms 内的重复调用直接复用上一次结果 (节流, 非正确性缓存)。
///
/// ## Registry
/// 按名字注册工厂, 进程级单例懒加载, 见 `registry.rs`。
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;

use crate::detection::Detection;

/// 检测结果复用窗口
pub const DETECTION_CACHE_WINDOW: Duration = Duration::from_millis(100);

/// 同步检测后端
///
/// 实现者可以阻塞 (CPU/加速器推理); 调用方负责把它放到工作线程。
pub trait DetectionBackend: Send {
    /// 推理: RGB 帧 → 检测框 (帧像素坐标)
    fn predict(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;

    /// 后端名称 (用于日志)
    fn name(&self) -> &str {
        "custom"
    }
}

/// 深度估计后端
pub trait DepthEstimator: Send {
    /// 模型类型 (如 "MiDaS_small")
    fn model_type(&self) -> &str;

    /// 每个检测一个距离 (米), 顺序与输入一致
    fn estimate_distance_m(&mut self, frame: &RgbImage, detections: &[Detection]) -> Result<Vec<f32>>;
}

struct DetectorState {
    backend: Box<dyn DetectionBackend>,
    last: Option<(Instant, Vec<Detection>)>,
}

/// 带节流的检测器
///
/// 锁覆盖 "检查缓存 + 推理" 整个过程, 同一窗口内的并发调用只推理一次。
pub struct Detector {
    state: Mutex<DetectorState>,
    window: Duration,
}

impl Detector {
    pub fn new(backend: Box<dyn DetectionBackend>) -> Self {
        Self {
            state: Mutex::new(DetectorState {
                backend,
                last: None,
            }),
            window: DETECTION_CACHE_WINDOW,
        }
    }

    pub fn with_cache_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn backend_name(&self) -> String {
        self.lock().backend.name().to_string()
    }

    /// 推理 (带缓存)
    pub fn infer(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some((at, detections)) = &state.last {
            if now.duration_since(*at) < self.window {
                return Ok(detections.clone());
            }
        }

        let detections = state.backend.predict(frame)?;
        state.last = Some((now, detections.clone()));
        Ok(detections)
    }
}

pub mod depth;
#[cfg(feature = "onnx")]
pub mod midas;
pub mod registry;
#[cfg(feature = "onnx")]
pub mod yolov8;

// Re-exports
#[cfg(feature = "onnx")]
pub use midas::MiDaS;
pub use registry::{
    available_depth_backends, available_detector_backends, get_depth_estimator, get_detector,
    register_depth_backend, register_depth_estimator, register_detector_backend,
    register_detector_factory, reset_depth_estimator, reset_detector, DepthFactory,
    DetectorFactory, SharedDepthEstimator,
};
#[cfg(feature = "onnx")]
pub use yolov8::YOLOv8;
