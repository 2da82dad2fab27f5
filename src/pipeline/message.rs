//! 元数据消息 (Outbound metadata schema)
//!
//! ```json
//! {"timestamp": 1712.0, "frame_id": 42, "fps": null,
//!  "detections": [{"box": {"x":..,"y":..,"width":..,"height":..},
//!                  "label": 0, "label_text": "Person", "confidence": 0.9,
//!                  "distance": 2.5, "position": {"x":..,"y":..,"z":..},
//!                  "interpolated": false}]}
//! ```

use serde::{Deserialize, Serialize};

use crate::config::CameraSettings;
use crate::detection::{
    label_text, normalize_bbox, unproject_bbox_center_to_camera, Detection, IntrinsicsCache,
    NormalizedBox,
};

/// 相机坐标 (米)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    #[serde(rename = "box")]
    pub bbox: NormalizedBox,
    pub label: u32,
    pub label_text: String,
    pub confidence: f32,
    pub distance: f32,
    pub position: Position,
    pub interpolated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataMessage {
    /// 毫秒
    pub timestamp: f64,
    pub frame_id: u64,
    pub detections: Vec<DetectionPayload>,
    pub fps: Option<f32>,
}

impl MetadataMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// 订阅者 → 分析服务的控制消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Ping,
    Pong,
}

/// 构造元数据消息: 归一化、标签、反投影
pub struct MessageBuilder {
    intrinsics: IntrinsicsCache,
    fps_report_every: u64,
}

impl MessageBuilder {
    pub fn new(camera: CameraSettings, fps_report_every: u64) -> Self {
        Self {
            intrinsics: IntrinsicsCache::new(camera),
            fps_report_every: fps_report_every.max(1),
        }
    }

    fn payload(
        &mut self,
        det: &Detection,
        distance: f32,
        interpolated: bool,
        width: u32,
        height: u32,
    ) -> Option<DetectionPayload> {
        let bbox = normalize_bbox(&det.bbox, width, height)?;
        let k = self.intrinsics.get(width, height);
        let (x, y, z) = unproject_bbox_center_to_camera(&det.bbox, distance as f64, &k);
        Some(DetectionPayload {
            bbox,
            label: det.class_id,
            label_text: label_text(det.class_id),
            confidence: det.confidence,
            distance,
            position: Position { x, y, z },
            interpolated,
        })
    }

    /// `fresh` 为本帧真实检测, `interpolated` 为追踪器补出的检测;
    /// 零面积框被丢弃。FPS 每 `fps_report_every` 帧附带一次。
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        width: u32,
        height: u32,
        fresh: (&[Detection], &[f32]),
        interpolated: (&[Detection], &[f32]),
        timestamp_s: f64,
        frame_id: u64,
        current_fps: f32,
    ) -> MetadataMessage {
        let mut detections = Vec::with_capacity(fresh.0.len() + interpolated.0.len());

        for (det, &distance) in fresh.0.iter().zip(fresh.1) {
            if let Some(p) = self.payload(det, distance, false, width, height) {
                detections.push(p);
            }
        }
        for (det, &distance) in interpolated.0.iter().zip(interpolated.1) {
            if let Some(p) = self.payload(det, distance, true, width, height) {
                detections.push(p);
            }
        }

        MetadataMessage {
            timestamp: timestamp_s * 1000.0,
            frame_id,
            detections,
            fps: (frame_id % self.fps_report_every == 0).then_some(current_fps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> MessageBuilder {
        let camera = CameraSettings {
            fov_x_deg: 90.0,
            ..CameraSettings::default()
        };
        MessageBuilder::new(camera, 30)
    }

    #[test]
    fn test_schema_field_names() {
        let mut b = builder();
        let fresh = [Detection::new(0, 0, 64, 48, 0, 0.9)];
        let msg = b.build(640, 480, (&fresh, &[2.0]), (&[], &[]), 1.5, 30, 24.0);
        let v: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(v["timestamp"], 1500.0);
        assert_eq!(v["frame_id"], 30);
        assert_eq!(v["fps"], 24.0);
        let d = &v["detections"][0];
        assert_eq!(d["box"]["x"], 0.0);
        assert_eq!(d["box"]["width"], 0.1);
        assert_eq!(d["label"], 0);
        assert_eq!(d["label_text"], "Person");
        assert_eq!(d["interpolated"], false);
        assert_eq!(d["position"]["z"], 2.0);
    }

    #[test]
    fn test_fps_only_every_nth_frame() {
        let mut b = builder();
        let msg = b.build(640, 480, (&[], &[]), (&[], &[]), 0.0, 31, 24.0);
        assert!(msg.fps.is_none());
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"fps\":null"));
    }

    #[test]
    fn test_degenerate_boxes_dropped_and_flags_set() {
        let mut b = builder();
        let fresh = [
            Detection::new(10, 10, 10, 40, 2, 0.9),
            Detection::new(10, 10, 50, 40, 2, 0.9),
        ];
        let interp = [Detection::new(100, 100, 140, 140, 999, 0.5)];
        let msg = b.build(640, 480, (&fresh, &[1.0, 1.0]), (&interp, &[3.0]), 0.0, 1, 30.0);
        assert_eq!(msg.detections.len(), 2);
        assert!(!msg.detections[0].interpolated);
        assert!(msg.detections[1].interpolated);
        assert_eq!(msg.detections[1].label_text, "Unknown (999)");
    }

    #[test]
    fn test_unprojected_position() {
        let mut b = builder();
        // centre (340, 260) with fx = fy = 320, principal point (320, 240)
        let fresh = [Detection::new(320, 240, 360, 280, 0, 0.9)];
        let msg = b.build(640, 480, (&fresh, &[3.2]), (&[], &[]), 0.0, 1, 30.0);
        let p = msg.detections[0].position;
        assert!((p.x - 0.2).abs() < 1e-6);
        assert!((p.y - 0.2).abs() < 1e-6);
        assert!((p.z - 3.2).abs() < 1e-6);
    }

    #[test]
    fn test_control_messages() {
        let ping: ControlMessage = serde_json::from_str(r#"{"type":"ping","seq":3}"#).unwrap();
        assert_eq!(ping, ControlMessage::Ping);
        assert_eq!(serde_json::to_string(&ControlMessage::Pong).unwrap(), r#"{"type":"pong"}"#);
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"bogus"}"#).is_err());
    }
}
