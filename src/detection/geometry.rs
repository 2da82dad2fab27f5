//! 几何工具 (Geometry helpers)
//!
//! IoU / NMS, box normalisation, pinhole intrinsics and unprojection,
//! and the lerp helpers used by track interpolation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::types::{BoxXyxy, Detection};
use crate::config::CameraSettings;

// ========== IoU / NMS ==========

/// 计算两个边界框的IOU (Intersection over Union)
///
/// Zero-area boxes give 0.
pub fn iou(a: &BoxXyxy, b: &BoxXyxy) -> f32 {
    let x1 = a.x1.max(b.x1) as f64;
    let y1 = a.y1.max(b.y1) as f64;
    let x2 = a.x2.min(b.x2) as f64;
    let y2 = a.y2.min(b.y2) as f64;

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.area() as f64 + b.area() as f64 - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    (intersection / union) as f32
}

/// 按类别的非极大值抑制, 结果按置信度降序
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|d1, d2| d2.confidence.total_cmp(&d1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id != xs[index].class_id {
                continue;
            }
            if iou(&xs[prev_index].bbox, &xs[index].bbox) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

// ========== 归一化 ==========

/// 归一化检测框 (x, y, width, height 均在 [0, 1])
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Returns `None` for zero-area boxes.
pub fn normalize_bbox(bbox: &BoxXyxy, frame_width: u32, frame_height: u32) -> Option<NormalizedBox> {
    if bbox.is_degenerate() {
        return None;
    }
    let w = frame_width.max(1) as f64;
    let h = frame_height.max(1) as f64;
    Some(NormalizedBox {
        x: (bbox.x1 as f64 / w).clamp(0.0, 1.0),
        y: (bbox.y1 as f64 / h).clamp(0.0, 1.0),
        width: (bbox.width() as f64 / w).clamp(0.0, 1.0),
        height: (bbox.height() as f64 / h).clamp(0.0, 1.0),
    })
}

// ========== 相机内参 ==========

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// 针孔模型内参
///
/// 优先级: 显式 fx/fy/cx/cy (> 0) → 由 FOV 推导 → 默认值 (主点居中, fy = fx)。
/// 没有任何焦距来源时 fx/fy 为 0, 反投影会退化为 (0, 0, depth)。
pub fn compute_camera_intrinsics(width: u32, height: u32, camera: &CameraSettings) -> CameraIntrinsics {
    let width = width.max(1) as f64;
    let height = height.max(1) as f64;

    let mut fx = camera.fx;
    let mut fy = camera.fy;
    let mut cx = camera.cx;
    let mut cy = camera.cy;

    if fx <= 0.0 && camera.fov_x_deg > 0.0 {
        fx = width / (2.0 * (camera.fov_x_deg.to_radians() / 2.0).tan());
    }
    if fy <= 0.0 {
        fy = if camera.fov_y_deg > 0.0 {
            height / (2.0 * (camera.fov_y_deg.to_radians() / 2.0).tan())
        } else {
            fx
        };
    }

    if cx <= 0.0 {
        cx = width / 2.0;
    }
    if cy <= 0.0 {
        cy = height / 2.0;
    }

    CameraIntrinsics {
        fx: fx.max(0.0),
        fy: fy.max(0.0),
        cx,
        cy,
    }
}

/// 按分辨率缓存内参
pub struct IntrinsicsCache {
    camera: CameraSettings,
    entries: HashMap<(u32, u32), CameraIntrinsics>,
    logged: bool,
}

impl IntrinsicsCache {
    pub fn new(camera: CameraSettings) -> Self {
        Self {
            camera,
            entries: HashMap::new(),
            logged: false,
        }
    }

    pub fn get(&mut self, width: u32, height: u32) -> CameraIntrinsics {
        let camera = &self.camera;
        let k = *self
            .entries
            .entry((width, height))
            .or_insert_with(|| compute_camera_intrinsics(width, height, camera));

        if camera.log_intrinsics && !self.logged {
            info!(
                fx = k.fx,
                fy = k.fy,
                cx = k.cx,
                cy = k.cy,
                frame_width = width,
                frame_height = height,
                "camera_intrinsics"
            );
            self.logged = true;
        }
        k
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 检测框中心 + 深度 → 相机坐标系 (X, Y, Z), 单位米
pub fn unproject_bbox_center_to_camera(
    bbox: &BoxXyxy,
    depth_m: f64,
    k: &CameraIntrinsics,
) -> (f64, f64, f64) {
    if depth_m <= 0.0 || k.fx <= 0.0 || k.fy <= 0.0 {
        return (0.0, 0.0, depth_m.max(0.0));
    }

    let (u, v) = bbox.center();
    let x = (u - k.cx) * depth_m / k.fx;
    let y = (v - k.cy) * depth_m / k.fy;
    (x, y, depth_m)
}

// ========== 插值 ==========

pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

pub fn lerp_int(a: i32, b: i32, t: f64) -> i32 {
    lerp(a as f64, b as f64, t).round() as i32
}

/// t = (target - f1) / (f2 - f1), clamped to [0, clamp_max]; 0 when f1 == f2
pub fn interpolation_factor(frame1: u64, frame2: u64, target: u64, clamp_max: f64) -> f64 {
    if frame1 == frame2 {
        return 0.0;
    }
    let t = (target as f64 - frame1 as f64) / (frame2 as f64 - frame1 as f64);
    t.clamp(0.0, clamp_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(fov_x: f64, fov_y: f64) -> CameraSettings {
        CameraSettings {
            fov_x_deg: fov_x,
            fov_y_deg: fov_y,
            ..CameraSettings::default()
        }
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BoxXyxy::new(10, 10, 50, 50);
        let b = BoxXyxy::new(60, 60, 80, 80);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_degenerate_is_zero() {
        let a = BoxXyxy::new(10, 10, 10, 50);
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoxXyxy::new(10, 20, 50, 60);
        let b = BoxXyxy::new(12, 22, 52, 62);
        // 38*38 / (1600 + 1600 - 1444)
        let expected = 1444.0 / 1756.0;
        assert!((iou(&a, &b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nms_is_per_class() {
        let mut dets = vec![
            Detection::new(0, 0, 100, 100, 0, 0.6),
            Detection::new(2, 2, 100, 100, 0, 0.9),
            Detection::new(2, 2, 100, 100, 1, 0.5),
        ];
        non_max_suppression(&mut dets, 0.45);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].confidence, 0.9);
        assert_eq!(dets[1].class_id, 1);
    }

    #[test]
    fn test_normalize_drops_zero_area_and_clamps() {
        assert!(normalize_bbox(&BoxXyxy::new(5, 5, 5, 20), 100, 100).is_none());
        let n = normalize_bbox(&BoxXyxy::new(50, 0, 250, 100), 200, 100).unwrap();
        assert_eq!(n.x, 0.25);
        assert_eq!(n.width, 1.0);
        assert_eq!(n.height, 1.0);
    }

    #[test]
    fn test_intrinsics_from_horizontal_fov() {
        let k = compute_camera_intrinsics(640, 480, &camera(90.0, 0.0));
        assert!((k.fx - 320.0).abs() < 1e-6);
        assert_eq!(k.fy, k.fx);
        assert_eq!(k.cx, 320.0);
        assert_eq!(k.cy, 240.0);
    }

    #[test]
    fn test_intrinsics_explicit_overrides_win() {
        let cam = CameraSettings {
            fx: 500.0,
            cx: 100.0,
            ..camera(90.0, 90.0)
        };
        let k = compute_camera_intrinsics(640, 480, &cam);
        assert_eq!(k.fx, 500.0);
        assert!((k.fy - 240.0).abs() < 1e-6);
        assert_eq!(k.cx, 100.0);
        assert_eq!(k.cy, 240.0);
    }

    #[test]
    fn test_intrinsics_floor_size_to_one() {
        let k = compute_camera_intrinsics(0, 0, &camera(90.0, 0.0));
        assert_eq!(k.cx, 0.5);
        assert!((k.fx - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_intrinsics_cache_per_resolution() {
        let mut cache = IntrinsicsCache::new(camera(60.0, 0.0));
        let a = cache.get(640, 480);
        let b = cache.get(640, 480);
        let c = cache.get(320, 240);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_unproject_zero_depth() {
        let k = CameraIntrinsics {
            fx: 300.0,
            fy: 300.0,
            cx: 10.0,
            cy: 10.0,
        };
        let p = unproject_bbox_center_to_camera(&BoxXyxy::new(0, 0, 100, 100), 0.0, &k);
        assert_eq!(p, (0.0, 0.0, 0.0));
        let p = unproject_bbox_center_to_camera(&BoxXyxy::new(0, 0, 100, 100), -3.0, &k);
        assert_eq!(p, (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_unproject_pinhole() {
        let k = CameraIntrinsics {
            fx: 320.0,
            fy: 320.0,
            cx: 320.0,
            cy: 240.0,
        };
        let (x, y, z) = unproject_bbox_center_to_camera(&BoxXyxy::new(620, 440, 660, 520), 2.0, &k);
        assert!((x - 2.0).abs() < 1e-9);
        assert!((y - 1.5).abs() < 1e-9);
        assert_eq!(z, 2.0);
    }

    #[test]
    fn test_interpolation_factor_bounds() {
        assert_eq!(interpolation_factor(4, 4, 10, 1.5), 0.0);
        assert_eq!(interpolation_factor(2, 4, 3, 1.5), 0.5);
        assert_eq!(interpolation_factor(2, 4, 20, 1.5), 1.5);
        assert_eq!(interpolation_factor(2, 4, 1, 1.5), 0.0);
        assert_eq!(lerp_int(10, 12, 0.5), 11);
    }
}
