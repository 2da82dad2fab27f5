//! 配置参数 (Configuration surface)
//!
//! Every knob can come from a command-line flag, an environment variable, or
//! a JSON file with partial overrides.

use std::path::{Path, PathBuf};

use clap::{Args, Parser};
use serde::{Deserialize, Serialize};

use crate::error::{AnalyzerError, Result};

// ========== 默认值 ==========

pub const DEFAULT_DETECTOR_BACKEND: &str = "onnx";
pub const DEFAULT_DETECTOR_MODEL: &str = "models/yolov8n.onnx";
pub const DEFAULT_DEPTH_BACKEND: &str = "onnx";
pub const DEFAULT_DEPTH_MODEL: &str = "models/midas_small.onnx";

#[derive(Parser, Debug, Clone, Serialize, Deserialize, Default)]
#[command(name = "vision-analyzer", about = "Real-time detection + depth + tracking")]
#[serde(default)]
pub struct AnalyzerConfig {
    #[command(flatten)]
    pub detector: DetectorSettings,

    #[command(flatten)]
    pub depth: DepthSettings,

    #[command(flatten)]
    pub adaptive: AdaptiveSettings,

    #[command(flatten)]
    pub tracker: TrackerSettings,

    #[command(flatten)]
    pub camera: CameraSettings,

    #[command(flatten)]
    pub pipeline: PipelineSettings,
}

impl AnalyzerConfig {
    /// Load a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AnalyzerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let a = &self.adaptive;
        if a.min_scale <= 0.0 || a.min_scale > a.max_scale {
            return Err(AnalyzerError::Config(format!(
                "scale bounds must satisfy 0 < min_scale <= max_scale (got {}..{})",
                a.min_scale, a.max_scale
            )));
        }
        if a.smooth_factor <= 0.0 {
            return Err(AnalyzerError::Config(format!(
                "smooth_factor must be positive (got {})",
                a.smooth_factor
            )));
        }
        if self.tracker.max_history_size == 0 {
            return Err(AnalyzerError::Config(
                "max_history_size must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_consecutive_errors == 0 {
            return Err(AnalyzerError::Config(
                "max_consecutive_errors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// 检测模型参数
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Registered detector backend name
    #[arg(id = "detector_backend", long = "detector-backend", env = "DETECTOR_BACKEND", default_value = DEFAULT_DETECTOR_BACKEND)]
    pub backend: String,

    #[arg(id = "detector_model", long = "detector-model", env = "ONNX_MODEL_PATH", default_value = DEFAULT_DETECTOR_MODEL)]
    pub model_path: PathBuf,

    /// Square letterbox size fed to the network
    #[arg(long, env = "DETECTOR_IMAGE_SIZE", default_value_t = 640)]
    pub image_size: u32,

    #[arg(long, env = "DETECTOR_CONF_THRESHOLD", default_value_t = 0.25)]
    pub conf_threshold: f32,

    /// NMS IoU threshold
    #[arg(id = "detector_iou", long = "detector-iou", env = "DETECTOR_IOU_THRESHOLD", default_value_t = 0.45)]
    pub iou_threshold: f32,

    #[arg(long, env = "DETECTOR_MAX_DETECTIONS", default_value_t = 100)]
    pub max_detections: usize,

    #[arg(long, env = "DETECTOR_NUM_CLASSES", default_value_t = 80)]
    pub num_classes: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: PathBuf::from(DEFAULT_DETECTOR_MODEL),
            image_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 100,
            num_classes: 80,
        }
    }
}

/// 深度估计参数
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthSettings {
    #[arg(id = "depth_backend", long = "depth-backend", env = "DEPTH_BACKEND", default_value = DEFAULT_DEPTH_BACKEND)]
    pub backend: String,

    #[arg(id = "depth_model", long = "depth-model", env = "MIDAS_ONNX_MODEL_PATH", default_value = DEFAULT_DEPTH_MODEL)]
    pub model_path: PathBuf,

    /// Where depth weights are looked up when the model path is relative
    #[arg(long, env = "MIDAS_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, env = "MIDAS_MODEL_TYPE", default_value = "MiDaS_small")]
    pub model_type: String,

    #[arg(long = "depth-input-size", env = "MIDAS_INPUT_SIZE", default_value_t = 256)]
    pub input_size: u32,

    /// Side of the square sampled around each box centre
    #[arg(long, env = "REGION_SIZE", default_value_t = 5)]
    pub region_size: u32,

    /// Inverse depth → metres calibration
    #[arg(long, env = "SCALE_FACTOR", default_value_t = 432.0)]
    pub scale_factor: f32,

    /// Run the depth model every N calls
    #[arg(long, env = "UPDATE_FREQ", default_value_t = 2)]
    pub update_freq: u32,
}

impl DepthSettings {
    /// Default cache directory under the user cache dir.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("robot-vision")
                .join("depth")
        })
    }
}

impl Default for DepthSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DEPTH_BACKEND.to_string(),
            model_path: PathBuf::from(DEFAULT_DEPTH_MODEL),
            cache_dir: None,
            model_type: "MiDaS_small".to_string(),
            input_size: 256,
            region_size: 5,
            scale_factor: 432.0,
            update_freq: 2,
        }
    }
}

/// 自适应分辨率参数
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    #[arg(long, env = "TARGET_SCALE_INIT", default_value_t = 0.8)]
    pub target_scale_init: f32,

    #[arg(long, env = "SMOOTH_FACTOR", default_value_t = 0.15)]
    pub smooth_factor: f32,

    #[arg(long, env = "MIN_SCALE", default_value_t = 0.2)]
    pub min_scale: f32,

    #[arg(long, env = "MAX_SCALE", default_value_t = 1.0)]
    pub max_scale: f32,

    /// Below this FPS every 2nd frame is detected, otherwise every 4th
    #[arg(long, env = "FPS_THRESHOLD", default_value_t = 15.0)]
    pub fps_threshold: f32,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            target_scale_init: 0.8,
            smooth_factor: 0.15,
            min_scale: 0.2,
            max_scale: 1.0,
            fps_threshold: 15.0,
        }
    }
}

/// 目标追踪参数
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    #[arg(id = "tracking_iou", long = "tracking-iou", env = "TRACKING_IOU_THRESHOLD", default_value_t = 0.3)]
    pub iou_threshold: f32,

    #[arg(long, env = "TRACKING_MAX_FRAMES_WITHOUT_DETECTION", default_value_t = 15)]
    pub max_frames_without_detection: u64,

    #[arg(long, env = "TRACKING_EARLY_TERMINATION_IOU", default_value_t = 0.9)]
    pub early_termination_iou: f32,

    #[arg(long, env = "TRACKING_CONFIDENCE_DECAY", default_value_t = 0.1)]
    pub confidence_decay: f32,

    #[arg(long, env = "TRACKING_MAX_HISTORY_SIZE", default_value_t = 5)]
    pub max_history_size: usize,

    /// Matches needed before a track is published
    #[arg(long, env = "TRACKING_DETECTION_THRESHOLD", default_value_t = 2)]
    pub detection_threshold: u32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_frames_without_detection: 15,
            early_termination_iou: 0.9,
            confidence_decay: 0.1,
            max_history_size: 5,
            detection_threshold: 2,
        }
    }
}

/// 相机内参 (0 表示自动推导)
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    #[arg(long = "camera-fx", env = "CAMERA_FX", default_value_t = 0.0)]
    pub fx: f64,

    #[arg(long = "camera-fy", env = "CAMERA_FY", default_value_t = 0.0)]
    pub fy: f64,

    #[arg(long = "camera-cx", env = "CAMERA_CX", default_value_t = 0.0)]
    pub cx: f64,

    #[arg(long = "camera-cy", env = "CAMERA_CY", default_value_t = 0.0)]
    pub cy: f64,

    #[arg(long, env = "CAMERA_FOV_X_DEG", default_value_t = 60.0)]
    pub fov_x_deg: f64,

    #[arg(long, env = "CAMERA_FOV_Y_DEG", default_value_t = 0.0)]
    pub fov_y_deg: f64,

    #[arg(long, env = "LOG_INTRINSICS", default_value_t = false)]
    pub log_intrinsics: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            fx: 0.0,
            fy: 0.0,
            cx: 0.0,
            cy: 0.0,
            fov_x_deg: 60.0,
            fov_y_deg: 0.0,
            log_intrinsics: false,
        }
    }
}

/// 接收循环参数
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    #[arg(long, env = "RECV_TIMEOUT_MS", default_value_t = 5000)]
    pub recv_timeout_ms: u64,

    #[arg(long, env = "MAX_CONSECUTIVE_ERRORS", default_value_t = 5)]
    pub max_consecutive_errors: u32,

    #[arg(long, env = "RECONNECT_DELAY_MS", default_value_t = 1000)]
    pub reconnect_delay_ms: u64,

    /// Pause after a failed receive before trying again
    #[arg(long, env = "ERROR_BACKOFF_MS", default_value_t = 100)]
    pub error_backoff_ms: u64,

    /// Attach FPS to every Nth message
    #[arg(long, env = "FPS_REPORT_EVERY", default_value_t = 30)]
    pub fps_report_every: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 5000,
            max_consecutive_errors: 5,
            reconnect_delay_ms: 1000,
            error_backoff_ms: 100,
            fps_report_every: 30,
        }
    }
}
