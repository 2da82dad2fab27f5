/// 视频分析流水线 (Video Analysis Pipeline)
///
/// 双线程架构, 通过容量为 1 的 crossbeam 通道通信:
/// - 接收循环: 取帧、自适应缩放、按节奏投递 (独立线程)
/// - 推理线程: 检测 → 深度 → 跟踪 → 元数据广播 (独立线程)
///
/// 订阅者数量控制启停, 测得的 FPS 反馈给自适应控制器。
pub mod adaptive;
pub mod frame;
pub mod inference;
pub mod message;
pub mod orchestrator;
pub mod source;
pub mod subscriber;

pub use adaptive::{calculate_adaptive_scale, resize_frame, AdaptiveController, FpsUpdate};
pub use frame::{PixelFormat, VideoFrame};
pub use inference::{FrameJob, InferenceStep, SharedTracker};
pub use message::{ControlMessage, DetectionPayload, MessageBuilder, MetadataMessage, Position};
pub use orchestrator::{work_slot, FramePipeline, WorkReceiver, WorkSlot};
pub use source::{ChannelSource, FrameSource, SessionLease, SharedSession, UpstreamSession};
pub use subscriber::{BroadcastReport, ChannelSubscriber, Subscriber, SubscriberId, SubscriberSet};
