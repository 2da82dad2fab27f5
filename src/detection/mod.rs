/// 检测与追踪 (Detection & Tracking)
///
/// - types:    检测框 / 检测结果 / 追踪记录
/// - geometry: IoU、NMS、归一化、相机内参与反投影
/// - labels:   COCO 类别标签
/// - track:    单目标历史与插值
/// - tracker:  多目标匹配管理器
pub mod geometry;
pub mod labels;
pub mod track;
pub mod tracker;
pub mod types;

pub use geometry::{
    compute_camera_intrinsics, iou, non_max_suppression, normalize_bbox,
    unproject_bbox_center_to_camera, CameraIntrinsics, IntrinsicsCache, NormalizedBox,
};
pub use labels::label_text;
pub use track::{TrackHistory, TrackedObject};
pub use tracker::TrackingManager;
pub use types::{BoxXyxy, Detection, Mask, TrackedDetection};
