use std::sync::Arc;

use image::GrayImage;

/// 检测/追踪数据结构定义
/// Data structures shared by detection, depth and tracking

/// 分割掩码 (非零像素属于目标), 与帧对齐
pub type Mask = Arc<GrayImage>;

// ========== 数据结构 ==========

/// 像素坐标检测框 (x1, y1) 左上, (x2, y2) 右下
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BoxXyxy {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoxXyxy {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// 中心点 (整数像素, 用于深度采样)
    pub fn center_px(&self) -> (i32, i32) {
        ((self.x1 + self.x2).div_euclid(2), (self.y1 + self.y2).div_euclid(2))
    }

    /// 中心点 (浮点, 用于反投影)
    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }
}

/// 单次推理得到的检测结果, 生成后不再修改
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BoxXyxy,
    pub class_id: u32,
    /// [0, 1]
    pub confidence: f32,
    pub mask: Option<Mask>,
}

impl Detection {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32, class_id: u32, confidence: f32) -> Self {
        Self {
            bbox: BoxXyxy::new(x1, y1, x2, y2),
            class_id,
            confidence,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: Mask) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// 带追踪元数据的检测 (距离/帧号/时间戳)
#[derive(Clone, Debug)]
pub struct TrackedDetection {
    pub detection: Detection,
    /// 米
    pub distance: f32,
    pub frame_id: u64,
    /// 秒
    pub timestamp: f64,
}

impl TrackedDetection {
    pub fn new(detection: Detection, distance: f32, frame_id: u64, timestamp: f64) -> Self {
        Self {
            detection,
            distance,
            frame_id,
            timestamp,
        }
    }

    pub fn bbox(&self) -> &BoxXyxy {
        &self.detection.bbox
    }

    pub fn confidence(&self) -> f32 {
        self.detection.confidence
    }
}
