// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
#![allow(clippy::type_complexity)]
pub mod config; // 运行参数
pub mod detection; // 检测框、几何与多目标追踪
pub mod error; // 错误类型
pub mod models; // 模型接口、注册表与具体实现
pub mod pipeline; // 帧流水线

#[cfg(test)]
pub(crate) mod testing;

pub use crate::config::AnalyzerConfig;
pub use crate::detection::{Detection, TrackingManager};
pub use crate::error::{AnalyzerError, Result};
pub use crate::models::{DepthEstimator, DetectionBackend, Detector};
pub use crate::pipeline::{FramePipeline, MetadataMessage, Subscriber, UpstreamSession};

/// 初始化日志: `RUST_LOG` 优先, 默认 info
///
/// 重复调用是安全的, 只有第一次生效。
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
