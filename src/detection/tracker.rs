//! 多目标跟踪管理器 (IoU tracking manager)
//!
//! Matches fresh detections to tracks by class + IoU and fills the frames in
//! between with interpolated detections.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::geometry::iou;
use super::track::TrackedObject;
use super::types::{Detection, TrackedDetection};
use crate::config::TrackerSettings;

pub struct TrackingManager {
    settings: TrackerSettings,
    tracks: BTreeMap<u64, TrackedObject>,
    next_track_id: u64,
}

impl TrackingManager {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            tracks: BTreeMap::new(),
            next_track_id: 0,
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// 匹配检测到已有轨迹, 未匹配的新建轨迹
    ///
    /// 返回每个检测对应的轨迹ID (与输入顺序一致)。
    /// `distances` 与 `detections` 一一对应, 多余的元素被忽略。
    pub fn match_detections_to_tracks(
        &mut self,
        detections: &[Detection],
        distances: &[f32],
        frame_id: u64,
        timestamp: f64,
    ) -> Vec<u64> {
        let mut used: HashSet<u64> = HashSet::new();
        let mut assigned = Vec::with_capacity(detections.len());

        for (det, &distance) in detections.iter().zip(distances) {
            let mut best: Option<u64> = None;
            let mut best_iou = 0.0f32;

            for (&track_id, track) in &self.tracks {
                if track.class_id != det.class_id || used.contains(&track_id) {
                    continue;
                }
                let Some(last) = track.history.last() else {
                    continue;
                };

                let score = iou(last.bbox(), &det.bbox);
                if score > best_iou && score >= self.settings.iou_threshold {
                    best_iou = score;
                    best = Some(track_id);
                    if best_iou >= self.settings.early_termination_iou {
                        break;
                    }
                }
            }

            let track_id = match best {
                Some(id) => id,
                None => {
                    let id = self.next_track_id;
                    self.next_track_id += 1;
                    self.tracks.insert(
                        id,
                        TrackedObject::new(id, det.class_id, self.settings.max_history_size),
                    );
                    debug!(track_id = id, class_id = det.class_id, "new track");
                    id
                }
            };

            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.add_detection(TrackedDetection::new(
                    det.clone(),
                    distance,
                    frame_id,
                    timestamp,
                ));
            }
            used.insert(track_id);
            assigned.push(track_id);
        }

        assigned
    }

    /// 为未更新的激活轨迹生成插值检测
    pub fn get_interpolated_detections_and_distances(
        &self,
        frame_id: u64,
        timestamp: f64,
        exclude: &HashSet<u64>,
    ) -> (Vec<Detection>, Vec<f32>) {
        let mut detections = Vec::new();
        let mut distances = Vec::new();

        for (track_id, track) in &self.tracks {
            if exclude.contains(track_id) || !track.is_active(self.settings.detection_threshold) {
                continue;
            }
            if let Some(interp) =
                track.get_interpolated(frame_id, timestamp, self.settings.confidence_decay)
            {
                distances.push(interp.distance);
                detections.push(interp.detection);
            }
        }

        (detections, distances)
    }

    /// 删除过期轨迹, 返回删除数量
    pub fn remove_stale_tracks(&mut self, frame_id: u64) -> usize {
        let max_gap = self.settings.max_frames_without_detection;
        let before = self.tracks.len();
        self.tracks.retain(|_, track| match track.last_seen_frame {
            Some(last) => frame_id.saturating_sub(last) <= max_gap,
            None => false,
        });
        before - self.tracks.len()
    }

    /// 清空所有轨迹并重置ID计数
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.next_track_id = 0;
    }

    pub fn is_active(&self, track_id: u64) -> bool {
        self.tracks
            .get(&track_id)
            .is_some_and(|t| t.is_active(self.settings.detection_threshold))
    }

    pub fn track(&self, track_id: u64) -> Option<&TrackedObject> {
        self.tracks.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
