//! 单帧推理步骤 (detect → depth → track → interpolate → message)

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use image::RgbImage;
use tracing::{debug, trace};

use super::message::{MessageBuilder, MetadataMessage};
use crate::detection::{Detection, TrackingManager};
use crate::error::{AnalyzerError, Result};
use crate::models::{Detector, SharedDepthEstimator};

/// 跟踪器在分析循环与推理线程之间共享
pub type SharedTracker = Arc<Mutex<TrackingManager>>;

pub(crate) fn lock_tracker(tracker: &SharedTracker) -> MutexGuard<'_, TrackingManager> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 一次推理任务
pub struct FrameJob {
    pub frame_id: u64,
    /// 已按自适应系数缩放的帧
    pub frame: RgbImage,
    /// 取到这一帧时的墙钟时间 (秒), 写入消息
    pub captured_at: f64,
    /// 最近一次 FPS 结算的墙钟时间 (秒), 写入轨迹历史
    pub fps_time: f64,
    pub fps: f32,
}

pub struct InferenceStep {
    detector: Arc<Detector>,
    depth: SharedDepthEstimator,
    tracker: SharedTracker,
    builder: MessageBuilder,
}

impl InferenceStep {
    pub fn new(
        detector: Arc<Detector>,
        depth: SharedDepthEstimator,
        tracker: SharedTracker,
        builder: MessageBuilder,
    ) -> Self {
        Self {
            detector,
            depth,
            tracker,
            builder,
        }
    }

    fn estimate_depth(&self, frame: &RgbImage, detections: &[Detection]) -> Result<Vec<f32>> {
        let mut estimator = self.depth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let distances = estimator
            .estimate_distance_m(frame, detections)
            .map_err(AnalyzerError::Inference)?;
        if distances.len() != detections.len() {
            return Err(AnalyzerError::Inference(anyhow::anyhow!(
                "depth backend '{}' returned {} distances for {} detections",
                estimator.model_type(),
                distances.len(),
                detections.len()
            )));
        }
        Ok(distances)
    }

    /// 处理一帧; 没有可发布的检测时返回 `None`
    pub fn run(&mut self, job: &FrameJob) -> Result<Option<MetadataMessage>> {
        let t0 = Instant::now();
        let detections = self
            .detector
            .infer(&job.frame)
            .map_err(AnalyzerError::Inference)?;
        let t_detect = t0.elapsed();

        let distances = if detections.is_empty() {
            Vec::new()
        } else {
            self.estimate_depth(&job.frame, &detections)?
        };
        let t_depth = t0.elapsed().saturating_sub(t_detect);

        let (fresh, fresh_distances, interpolated, interpolated_distances) = {
            let mut tracker = lock_tracker(&self.tracker);

            let track_ids = if detections.is_empty() {
                Vec::new()
            } else {
                tracker.match_detections_to_tracks(&detections, &distances, job.frame_id, job.fps_time)
            };

            // 未确认的轨迹不输出
            let mut fresh = Vec::with_capacity(detections.len());
            let mut fresh_distances = Vec::with_capacity(detections.len());
            for ((det, &distance), id) in detections.iter().zip(&distances).zip(&track_ids) {
                if tracker.is_active(*id) {
                    fresh.push(det.clone());
                    fresh_distances.push(distance);
                }
            }

            let updated: HashSet<u64> = track_ids.into_iter().collect();
            let (interpolated, interpolated_distances) =
                tracker.get_interpolated_detections_and_distances(job.frame_id, job.fps_time, &updated);

            // 以本任务的帧号清理, 推理耗时不计入轨迹空窗
            let removed = tracker.remove_stale_tracks(job.frame_id);
            if removed > 0 {
                debug!(frame_id = job.frame_id, removed, "stale tracks removed");
            }
            (fresh, fresh_distances, interpolated, interpolated_distances)
        };

        trace!(
            frame_id = job.frame_id,
            detect_ms = t_detect.as_secs_f64() * 1000.0,
            depth_ms = t_depth.as_secs_f64() * 1000.0,
            fresh = fresh.len(),
            interpolated = interpolated.len(),
            "inference step"
        );

        if fresh.is_empty() && interpolated.is_empty() {
            return Ok(None);
        }

        let (width, height) = job.frame.dimensions();
        let message = self.builder.build(
            width,
            height,
            (&fresh, &fresh_distances),
            (&interpolated, &interpolated_distances),
            job.captured_at,
            job.frame_id,
            job.fps,
        );
        if message.detections.is_empty() {
            debug!(frame_id = job.frame_id, "all boxes degenerate, nothing to publish");
            return Ok(None);
        }
        Ok(Some(message))
    }
}
