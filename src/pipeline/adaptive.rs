//! 自适应分辨率与采样 (Adaptive scale + detection cadence)

use std::borrow::Cow;
use std::time::{Duration, Instant};

use fast_image_resize as fr;
use image::RgbImage;
use tracing::info;

use crate::config::AdaptiveSettings;
use crate::error::{AnalyzerError, Result};

/// FPS 统计窗口
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// 缩放系数不低于此值时不做缩放
pub const RESIZE_PASSTHROUGH: f32 = 0.98;

/// 初始 FPS (首个窗口结束前使用)
pub const INITIAL_FPS: f32 = 30.0;

/// 根据 FPS 调整缩放系数, 结果夹在 [min_scale, max_scale]
pub fn calculate_adaptive_scale(
    current_fps: f32,
    current_scale: f32,
    smooth_factor: f32,
    min_scale: f32,
    max_scale: f32,
) -> f32 {
    let next = if current_fps < 10.0 {
        current_scale - smooth_factor
    } else if current_fps < 18.0 {
        current_scale - smooth_factor * 0.5
    } else {
        current_scale + smooth_factor * 0.8
    };
    next.max(min_scale).min(max_scale)
}

/// 一次窗口结算的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsUpdate {
    pub fps: f32,
    pub scale: f32,
}

pub struct AdaptiveController {
    settings: AdaptiveSettings,
    window_frames: u64,
    last_fps_time: Instant,
    current_fps: f32,
    scale: f32,
}

impl AdaptiveController {
    pub fn new(settings: AdaptiveSettings, now: Instant) -> Self {
        let scale = settings
            .target_scale_init
            .max(settings.min_scale)
            .min(settings.max_scale);
        Self {
            settings,
            window_frames: 0,
            last_fps_time: now,
            current_fps: INITIAL_FPS,
            scale,
        }
    }

    /// 计一帧; 窗口满 1 秒时结算 FPS 并更新缩放
    pub fn record_frame(&mut self, now: Instant) -> Option<FpsUpdate> {
        self.window_frames += 1;

        let elapsed = now.saturating_duration_since(self.last_fps_time);
        if elapsed < FPS_WINDOW {
            return None;
        }

        self.current_fps = (self.window_frames as f64 / elapsed.as_secs_f64()) as f32;
        self.window_frames = 0;
        self.last_fps_time = now;
        self.apply_fps(self.current_fps);

        info!(
            scale = %format_args!("{:.2}", self.scale),
            fps = %format_args!("{:.1}", self.current_fps),
            "adaptive_resolution_update"
        );
        Some(FpsUpdate {
            fps: self.current_fps,
            scale: self.scale,
        })
    }

    /// 用给定 FPS 更新缩放系数
    pub fn apply_fps(&mut self, fps: f32) -> f32 {
        let s = &self.settings;
        self.scale =
            calculate_adaptive_scale(fps, self.scale, s.smooth_factor, s.min_scale, s.max_scale);
        self.scale
    }

    /// FPS 低于阈值时每 2 帧检测一次, 否则每 4 帧
    pub fn sample_rate(&self) -> u64 {
        if self.current_fps < self.settings.fps_threshold {
            2
        } else {
            4
        }
    }

    pub fn should_detect(&self, frame_id: u64) -> bool {
        frame_id % self.sample_rate() == 0
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn current_fps(&self) -> f32 {
        self.current_fps
    }

    /// 最近一次窗口结算的时刻
    pub fn last_fps_time(&self) -> Instant {
        self.last_fps_time
    }
}

/// 按缩放系数缩小帧; scale >= 0.98 原样返回
pub fn resize_frame(frame: &RgbImage, scale: f32) -> Result<Cow<'_, RgbImage>> {
    if scale >= RESIZE_PASSTHROUGH {
        return Ok(Cow::Borrowed(frame));
    }

    let (w, h) = frame.dimensions();
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);

    let src = fr::images::ImageRef::new(w, h, frame.as_raw(), fr::PixelType::U8x3)
        .map_err(|e| AnalyzerError::Frame(format!("resize source: {e}")))?;
    let mut dst = fr::images::Image::new(new_w, new_h, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .map_err(|e| AnalyzerError::Frame(format!("resize: {e}")))?;

    RgbImage::from_raw(new_w, new_h, dst.into_vec())
        .map(Cow::Owned)
        .ok_or_else(|| AnalyzerError::Frame("resized buffer size mismatch".to_string()))
}
