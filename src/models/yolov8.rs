// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测后端 (ONNX Runtime)
// 包含: 模型加载、letterbox 预处理、推理、解码 + NMS

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use ndarray::{Array4, ArrayViewD, Axis, Ix2};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::info;

use super::DetectionBackend;
use crate::config::DetectorSettings;
use crate::detection::{non_max_suppression, Detection};

/// letterbox 填充灰度 (114)
pub const PAD_VALUE: u8 = 114;

/// letterbox 结果
pub struct Letterbox {
    /// NCHW, [0, 1]
    pub tensor: Array4<f32>,
    pub ratio: f32,
    /// (left, top) 像素偏移
    pub pad: (f32, f32),
}

/// 等比缩放到 size × size, 居中, 四周用 114 填充
pub fn letterbox(frame: &RgbImage, size: u32) -> Letterbox {
    let (w0, h0) = frame.dimensions();
    let s = size as f32;
    let ratio = (s / h0.max(1) as f32).min(s / w0.max(1) as f32);
    let new_w = ((w0 as f32 * ratio).round() as u32).clamp(1, size);
    let new_h = ((h0 as f32 * ratio).round() as u32).clamp(1, size);
    let left = (size - new_w) / 2;
    let top = (size - new_h) / 2;

    let resized = imageops::resize(frame, new_w, new_h, imageops::FilterType::Triangle);

    let side = size as usize;
    let mut tensor = Array4::from_elem((1, 3, side, side), PAD_VALUE as f32 / 255.0);
    for (x, y, rgb) in resized.enumerate_pixels() {
        let x = (x + left) as usize;
        let y = (y + top) as usize;
        let [r, g, b] = rgb.0;
        tensor[[0, 0, y, x]] = r as f32 / 255.0;
        tensor[[0, 1, y, x]] = g as f32 / 255.0;
        tensor[[0, 2, y, x]] = b as f32 / 255.0;
    }

    Letterbox {
        tensor,
        ratio,
        pad: (left as f32, top as f32),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub num_classes: usize,
}

impl From<&DetectorSettings> for DecodeParams {
    fn from(s: &DetectorSettings) -> Self {
        Self {
            conf_threshold: s.conf_threshold,
            iou_threshold: s.iou_threshold,
            max_detections: s.max_detections,
            num_classes: s.num_classes,
        }
    }
}

/// 解码原始输出
///
/// 接受 (1, 4+nc, N) / (1, N, 4+nc), 以及带 objectness 的 5+nc 变体。
/// 框映射回原图坐标并裁剪到 [0, w-1] × [0, h-1], 按类别 NMS 后按置信度降序。
pub fn decode_predictions(
    output: ArrayViewD<'_, f32>,
    params: &DecodeParams,
    ratio: f32,
    pad: (f32, f32),
    frame_size: (u32, u32),
) -> Result<Vec<Detection>> {
    let nc = params.num_classes;
    let mut view = output;
    while view.ndim() > 2 && view.shape()[0] == 1 {
        view = view.index_axis_move(Axis(0), 0);
    }
    let preds = view
        .into_dimensionality::<Ix2>()
        .context("unexpected detector output rank")?;

    let channels_ok = |c: usize| c == 4 + nc || c == 5 + nc;
    let preds = if channels_ok(preds.ncols()) {
        preds
    } else {
        preds.reversed_axes()
    };
    if !channels_ok(preds.ncols()) {
        bail!(
            "detector output has {} channels, expected {} or {}",
            preds.ncols(),
            4 + nc,
            5 + nc
        );
    }
    let has_objectness = preds.ncols() == 5 + nc;
    let cls_offset = if has_objectness { 5 } else { 4 };

    let ratio = ratio.max(f32::EPSILON);
    let max_x = frame_size.0.saturating_sub(1) as f32;
    let max_y = frame_size.1.saturating_sub(1) as f32;

    let mut data = Vec::new();
    for pred in preds.axis_iter(Axis(0)) {
        let objectness = if has_objectness { pred[4] } else { 1.0 };
        let Some((class_id, score)) = pred
            .iter()
            .skip(cls_offset)
            .take(nc)
            .map(|s| s * objectness)
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };
        if score < params.conf_threshold {
            continue;
        }

        let (cx, cy, w, h) = (pred[0], pred[1], pred[2], pred[3]);
        let x1 = ((cx - w / 2.0 - pad.0) / ratio).clamp(0.0, max_x);
        let y1 = ((cy - h / 2.0 - pad.1) / ratio).clamp(0.0, max_y);
        let x2 = ((cx + w / 2.0 - pad.0) / ratio).clamp(0.0, max_x);
        let y2 = ((cy + h / 2.0 - pad.1) / ratio).clamp(0.0, max_y);

        data.push(Detection::new(
            x1.round() as i32,
            y1.round() as i32,
            x2.round() as i32,
            y2.round() as i32,
            class_id as u32,
            score,
        ));
    }

    non_max_suppression(&mut data, params.iou_threshold);
    data.truncate(params.max_detections);
    Ok(data)
}

/// YOLOv8 ONNX 检测器
pub struct YOLOv8 {
    session: Session,
    input_name: String,
    output_name: String,
    image_size: u32,
    params: DecodeParams,
}

impl YOLOv8 {
    /// 加载模型; `model_path` 覆盖配置中的路径
    pub fn new(settings: &DetectorSettings, model_path: Option<&Path>) -> Result<Self> {
        let path = model_path.unwrap_or(&settings.model_path);
        if !path.exists() {
            bail!("ONNX model not found at {}", path.display());
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)
            .with_context(|| format!("failed to load ONNX model {}", path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("model has no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("model has no outputs")?;

        info!(
            model = %path.display(),
            input = %input_name,
            output = %output_name,
            image_size = settings.image_size,
            "yolov8 model loaded"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            image_size: settings.image_size,
            params: DecodeParams::from(settings),
        })
    }
}

impl DetectionBackend for YOLOv8 {
    fn predict(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let lb = letterbox(frame, self.image_size);
        let input = Tensor::from_array(lb.tensor)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("detector inference failed")?;
        let output: ArrayViewD<f32> = outputs[self.output_name.as_str()]
            .try_extract_array()
            .context("failed to extract detector output")?;

        decode_predictions(output, &self.params, lb.ratio, lb.pad, frame.dimensions())
    }

    fn name(&self) -> &str {
        "onnx"
    }
}
