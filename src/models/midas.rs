// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// MiDaS 单目深度估计 (ONNX Runtime)
// 输出逆深度图, 按检测框中心区域或分割掩码采样后换算成米

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use ndarray::{Array4, ArrayViewD, Axis, Ix2};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info};

use super::depth::{calculate_distances, resize_to_frame, DepthMap, DepthThrottle};
use super::DepthEstimator;
use crate::config::DepthSettings;
use crate::detection::Detection;

/// ImageNet 均值 / 标准差
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 相对路径先按原样查找, 再到缓存目录下查找
pub fn resolve_model_path(model_path: &Path, cache_dir: &Path) -> Option<PathBuf> {
    if model_path.exists() {
        return Some(model_path.to_path_buf());
    }
    if model_path.is_absolute() {
        return None;
    }

    let candidates = [
        Some(cache_dir.join(model_path)),
        model_path.file_name().map(|name| cache_dir.join(name)),
    ];
    candidates.into_iter().flatten().find(|p| p.exists())
}

/// 缩放到 size × size, ImageNet 归一化, NCHW
pub fn preprocess(frame: &RgbImage, size: u32) -> Array4<f32> {
    let resized = imageops::resize(frame, size, size, imageops::FilterType::Triangle);
    let side = size as usize;
    let mut tensor = Array4::zeros((1, 3, side, side));
    for (x, y, rgb) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (rgb.0[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    tensor
}

/// (1, H, W) / (1, 1, H, W) / (H, W) → 深度图
pub fn depth_map_from_output(output: ArrayViewD<'_, f32>) -> Result<DepthMap> {
    let mut view = output;
    while view.ndim() > 2 && view.shape()[0] == 1 {
        view = view.index_axis_move(Axis(0), 0);
    }
    let view = view
        .into_dimensionality::<Ix2>()
        .context("unexpected depth output rank")?;
    let (h, w) = view.dim();
    let data: Vec<f32> = view.iter().copied().collect();
    match DepthMap::from_raw(w as u32, h as u32, data) {
        Some(map) => Ok(map),
        None => bail!("depth output {h}x{w} does not fit an image buffer"),
    }
}

pub struct MiDaS {
    session: Session,
    input_name: String,
    output_name: String,
    model_type: String,
    input_size: u32,
    region_size: u32,
    scale_factor: f32,
    throttle: DepthThrottle,
}

impl MiDaS {
    /// `cache_dir` 覆盖配置中的缓存目录
    pub fn new(settings: &DepthSettings, cache_dir: Option<&Path>) -> Result<Self> {
        let cache_dir = cache_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| settings.resolved_cache_dir());
        let Some(path) = resolve_model_path(&settings.model_path, &cache_dir) else {
            bail!(
                "MiDaS ONNX model {} not found (cache dir {})",
                settings.model_path.display(),
                cache_dir.display()
            );
        };

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&path)
            .with_context(|| format!("failed to load depth model {}", path.display()))?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("depth model has no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("depth model has no outputs")?;

        info!(
            model = %path.display(),
            model_type = %settings.model_type,
            input_size = settings.input_size,
            update_freq = settings.update_freq,
            "midas model loaded"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            model_type: settings.model_type.clone(),
            input_size: settings.input_size,
            region_size: settings.region_size,
            scale_factor: settings.scale_factor,
            throttle: DepthThrottle::new(settings.update_freq),
        })
    }

    /// 推理得到与帧同尺寸的逆深度图
    pub fn predict_depth(&mut self, frame: &RgbImage) -> Result<DepthMap> {
        let input = Tensor::from_array(preprocess(frame, self.input_size))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("depth inference failed")?;
        let output: ArrayViewD<f32> = outputs[self.output_name.as_str()]
            .try_extract_array()
            .context("failed to extract depth output")?;

        let depth = depth_map_from_output(output)?;
        let (w, h) = frame.dimensions();
        Ok(resize_to_frame(&depth, w, h))
    }
}

impl DepthEstimator for MiDaS {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn estimate_distance_m(&mut self, frame: &RgbImage, detections: &[Detection]) -> Result<Vec<f32>> {
        if detections.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(distances) = self.throttle.reuse(detections.len()) {
            debug!(count = distances.len(), "reusing depth from previous pass");
            return Ok(distances);
        }

        let depth = self.predict_depth(frame)?;
        let distances = calculate_distances(&depth, detections, self.region_size, self.scale_factor);
        self.throttle.store(&distances);
        Ok(distances)
    }
}
