//! 单目标轨迹 (Single-object track)
//! Bounded history ring buffer + linear interpolation between the two latest observations

use super::geometry::{interpolation_factor, lerp, lerp_int};
use super::types::{Detection, TrackedDetection};

/// 最大外推系数 (允许超过最后一次真实检测)
pub const MAX_EXTRAPOLATION: f64 = 1.5;

// ========== 环形缓冲 ==========

/// 固定容量的历史记录, 满时覆盖最旧的一条
#[derive(Clone, Debug)]
pub struct TrackHistory {
    entries: Vec<TrackedDetection>,
    /// 最旧元素的位置 (仅在已满时有意义)
    head: usize,
    capacity: usize,
}

impl TrackHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    pub fn push(&mut self, item: TrackedDetection) {
        if self.entries.len() < self.capacity {
            self.entries.push(item);
        } else {
            self.entries[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 逻辑下标 0 = 最旧
    pub fn get(&self, index: usize) -> Option<&TrackedDetection> {
        if index >= self.entries.len() {
            return None;
        }
        self.entries.get((self.head + index) % self.entries.len())
    }

    pub fn last(&self) -> Option<&TrackedDetection> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    /// 最近两条 (较早, 较新)
    pub fn last_two(&self) -> Option<(&TrackedDetection, &TrackedDetection)> {
        let n = self.len();
        if n < 2 {
            return None;
        }
        Some((self.get(n - 2)?, self.get(n - 1)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedDetection> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

// ========== 跟踪对象 ==========

/// 跨帧跟踪的单个物体
#[derive(Clone, Debug)]
pub struct TrackedObject {
    /// 唯一跟踪ID (单调递增, 不复用)
    pub track_id: u64,

    /// 类别在生命周期内固定
    pub class_id: u32,

    pub history: TrackHistory,

    /// 最近一次匹配的帧号
    pub last_seen_frame: Option<u64>,

    /// 累计匹配次数 (只增不减)
    pub detection_count: u32,
}

impl TrackedObject {
    pub fn new(track_id: u64, class_id: u32, max_history_size: usize) -> Self {
        Self {
            track_id,
            class_id,
            history: TrackHistory::with_capacity(max_history_size),
            last_seen_frame: None,
            detection_count: 0,
        }
    }

    pub fn add_detection(&mut self, detection: TrackedDetection) {
        self.last_seen_frame = Some(detection.frame_id);
        self.history.push(detection);
        self.detection_count = self.detection_count.saturating_add(1);
    }

    pub fn is_active(&self, detection_threshold: u32) -> bool {
        self.detection_count >= detection_threshold
    }

    /// 插值/外推到目标帧
    ///
    /// 只有一条历史时原样返回; 否则用最近两条做线性插值,
    /// 置信度按 `conf1 * (1 - t * decay)` 衰减, t ∈ [0, 1.5]。
    pub fn get_interpolated(
        &self,
        target_frame_id: u64,
        target_timestamp: f64,
        confidence_decay: f32,
    ) -> Option<TrackedDetection> {
        let (d1, d2) = match self.history.last_two() {
            Some(pair) => pair,
            None => return self.history.last().cloned(),
        };

        let t = interpolation_factor(d1.frame_id, d2.frame_id, target_frame_id, MAX_EXTRAPOLATION);
        let (b1, b2) = (d1.bbox(), d2.bbox());

        let confidence = d1.confidence() as f64 * (1.0 - t * confidence_decay as f64);
        let detection = Detection::new(
            lerp_int(b1.x1, b2.x1, t),
            lerp_int(b1.y1, b2.y1, t),
            lerp_int(b1.x2, b2.x2, t),
            lerp_int(b1.y2, b2.y2, t),
            self.class_id,
            confidence as f32,
        );
        let distance = lerp(d1.distance as f64, d2.distance as f64, t) as f32;

        Some(TrackedDetection::new(
            detection,
            distance,
            target_frame_id,
            target_timestamp,
        ))
    }
}
