//! 深度图采样 (Depth-map sampling)
//!
//! Inverse-depth maps (larger = closer) are sampled per detection and turned
//! into metres with `scale_factor / max(inverse_depth, 1e-6)`.

use image::{imageops, ImageBuffer, Luma};

use crate::detection::Detection;

/// 单通道 f32 深度图, 与帧同尺寸
pub type DepthMap = ImageBuffer<Luma<f32>, Vec<f32>>;

pub const MIN_INVERSE_DEPTH: f32 = 1e-6;

/// 逆深度 → 米
pub fn inverse_depth_to_distance(inverse_depth: f32, scale_factor: f32) -> f32 {
    let depth = if inverse_depth.is_nan() {
        MIN_INVERSE_DEPTH
    } else {
        inverse_depth.max(MIN_INVERSE_DEPTH)
    };
    scale_factor / depth
}

/// 以 (cx, cy) 为中心、边长 region_size 的正方形, 裁剪到帧内
///
/// 返回半开区间 (x_start, x_end, y_start, y_end)。
pub fn region_bounds(
    center_x: i32,
    center_y: i32,
    region_size: u32,
    width: u32,
    height: u32,
) -> (u32, u32, u32, u32) {
    let half = (region_size / 2) as i64;
    let (cx, cy) = (center_x as i64, center_y as i64);
    let clip = |v: i64, max: u32| v.clamp(0, max as i64) as u32;
    (
        clip(cx - half, width),
        clip(cx + half + 1, width),
        clip(cy - half, height),
        clip(cy + half + 1, height),
    )
}

/// 检测框中心区域的平均逆深度
pub fn depth_from_bbox(depth: &DepthMap, det: &Detection, region_size: u32) -> f32 {
    let (cx, cy) = det.bbox.center_px();
    let (x0, x1, y0, y1) = region_bounds(cx, cy, region_size, depth.width(), depth.height());

    let mut sum = 0.0f64;
    let mut count = 0usize;
    for y in y0..y1 {
        for x in x0..x1 {
            sum += depth.get_pixel(x, y)[0] as f64;
            count += 1;
        }
    }

    if count == 0 {
        return MIN_INVERSE_DEPTH;
    }
    (sum / count as f64) as f32
}

/// 掩码像素的逆深度中位数 (对离群值鲁棒)
///
/// 掩码尺寸与深度图不一致时先最近邻缩放。空掩码返回 `MIN_INVERSE_DEPTH`。
pub fn depth_from_mask(depth: &DepthMap, det: &Detection) -> f32 {
    let Some(mask) = det.mask.as_deref() else {
        return MIN_INVERSE_DEPTH;
    };
    if mask.width() == 0 || mask.height() == 0 {
        return MIN_INVERSE_DEPTH;
    }

    let resized;
    let mask = if mask.dimensions() != depth.dimensions() {
        resized = imageops::resize(
            mask,
            depth.width(),
            depth.height(),
            imageops::FilterType::Nearest,
        );
        &resized
    } else {
        mask
    };

    let mut values: Vec<f32> = mask
        .pixels()
        .zip(depth.pixels())
        .filter(|(m, _)| m[0] != 0)
        .map(|(_, d)| d[0])
        .collect();

    if values.is_empty() {
        return MIN_INVERSE_DEPTH;
    }
    median(&mut values).max(MIN_INVERSE_DEPTH)
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// 每个检测一个距离: 有掩码用掩码中位数, 否则用中心区域均值
pub fn calculate_distances(
    depth: &DepthMap,
    detections: &[Detection],
    region_size: u32,
    scale_factor: f32,
) -> Vec<f32> {
    detections
        .iter()
        .map(|det| {
            let inverse_depth = if det.mask.is_some() {
                depth_from_mask(depth, det)
            } else {
                depth_from_bbox(depth, det, region_size)
            };
            inverse_depth_to_distance(inverse_depth, scale_factor)
        })
        .collect()
}

/// 深度图缩放到帧尺寸 (双线性)
pub fn resize_to_frame(depth: &DepthMap, width: u32, height: u32) -> DepthMap {
    if depth.dimensions() == (width, height) {
        return depth.clone();
    }
    imageops::resize(depth, width, height, imageops::FilterType::Triangle)
}

// ========== 节流 ==========

/// 每 `update_freq` 次调用只真正推理一次, 其余复用上次结果
/// (仅当检测数量不变时)
#[derive(Debug, Clone)]
pub struct DepthThrottle {
    update_freq: u32,
    update_id: u64,
    last: Vec<f32>,
}

impl DepthThrottle {
    pub fn new(update_freq: u32) -> Self {
        Self {
            update_freq: update_freq.max(1),
            update_id: 0,
            last: Vec::new(),
        }
    }

    /// 计数并判断是否可以复用; 可复用时返回上次结果
    pub fn reuse(&mut self, num_detections: usize) -> Option<Vec<f32>> {
        let id = self.update_id;
        self.update_id += 1;
        let due = id % self.update_freq as u64 == 0;
        if !due && self.last.len() == num_detections {
            Some(self.last.clone())
        } else {
            None
        }
    }

    pub fn store(&mut self, distances: &[f32]) {
        self.last = distances.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::sync::Arc;

    fn flat(width: u32, height: u32, value: f32) -> DepthMap {
        DepthMap::from_pixel(width, height, Luma([value]))
    }

    #[test]
    fn test_region_bounds_clip_to_frame() {
        assert_eq!(region_bounds(10, 10, 5, 100, 100), (8, 13, 8, 13));
        assert_eq!(region_bounds(0, 0, 5, 100, 100), (0, 3, 0, 3));
        assert_eq!(region_bounds(99, 99, 5, 100, 100), (97, 100, 97, 100));
        assert_eq!(region_bounds(-20, 5, 5, 100, 100), (0, 0, 3, 8));
    }

    #[test]
    fn test_bbox_region_mean() {
        let mut depth = flat(20, 20, 1.0);
        depth.put_pixel(10, 10, Luma([10.0]));
        let det = Detection::new(8, 8, 12, 12, 0, 0.9);
        // 3x3 region around (10, 10): eight 1.0 + one 10.0
        let v = depth_from_bbox(&depth, &det, 3);
        assert!((v - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_box_outside_frame_falls_back_to_epsilon() {
        let depth = flat(20, 20, 4.0);
        let det = Detection::new(100, 100, 140, 140, 0, 0.9);
        assert_eq!(depth_from_bbox(&depth, &det, 5), MIN_INVERSE_DEPTH);
        let d = calculate_distances(&depth, &[det], 5, 432.0);
        assert!((d[0] - 432.0 / MIN_INVERSE_DEPTH).abs() / d[0] < 1e-6);
    }

    #[test]
    fn test_mask_median_ignores_outliers() {
        let mut depth = flat(4, 4, 2.0);
        depth.put_pixel(0, 0, Luma([1000.0]));
        let mut mask = GrayImage::new(4, 4);
        for (x, y) in [(0, 0), (1, 0), (2, 0)] {
            mask.put_pixel(x, y, Luma([255]));
        }
        let det = Detection::new(0, 0, 4, 4, 0, 0.9).with_mask(Arc::new(mask));
        assert_eq!(depth_from_mask(&depth, &det), 2.0);
        let d = calculate_distances(&depth, &[det], 5, 10.0);
        assert_eq!(d, vec![5.0]);
    }

    #[test]
    fn test_mask_is_resized_to_depth_map() {
        let depth = flat(8, 8, 3.0);
        let mask = GrayImage::from_pixel(2, 2, Luma([1]));
        let det = Detection::new(0, 0, 8, 8, 0, 0.9).with_mask(Arc::new(mask));
        assert_eq!(depth_from_mask(&depth, &det), 3.0);
    }

    #[test]
    fn test_empty_mask_is_epsilon() {
        let depth = flat(4, 4, 3.0);
        let det = Detection::new(0, 0, 4, 4, 0, 0.9).with_mask(Arc::new(GrayImage::new(4, 4)));
        assert_eq!(depth_from_mask(&depth, &det), MIN_INVERSE_DEPTH);
    }

    #[test]
    fn test_throttle_reuses_between_updates() {
        let mut t = DepthThrottle::new(2);
        assert!(t.reuse(1).is_none());
        t.store(&[3.0]);
        assert_eq!(t.reuse(1), Some(vec![3.0]));
        assert!(t.reuse(1).is_none());
        t.store(&[4.0]);
        // count changed, must recompute
        assert!(t.reuse(2).is_none());
    }

    #[test]
    fn test_resize_keeps_flat_map_flat() {
        let depth = flat(4, 4, 7.0);
        let up = resize_to_frame(&depth, 16, 12);
        assert_eq!(up.dimensions(), (16, 12));
        assert!(up.pixels().all(|p| (p[0] - 7.0).abs() < 1e-4));
    }
}
