/// 上游解码帧 (Decoded upstream frame)
/// Frames arrive in whatever packed 8-bit layout the transport decoded to and
/// are converted once to the RGB working format.
use std::sync::Arc;

use image::RgbImage;

use crate::error::{AnalyzerError, Result};

// ========== 枚举类型 ==========

/// 打包像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Bgr8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

// ========== 数据结构 ==========

/// 已解码帧 (上游 → 接收循环)
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Arc<Vec<u8>>, // 使用Arc共享数据,避免复制
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data: Arc::new(data),
        }
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, PixelFormat::Rgb8, image.into_raw())
    }

    /// 转换为 RGB 工作格式
    pub fn to_rgb(&self) -> Result<RgbImage> {
        let expected = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        if self.width == 0 || self.height == 0 || self.data.len() != expected {
            return Err(AnalyzerError::Frame(format!(
                "{:?} frame {}x{} needs {} bytes, got {}",
                self.format,
                self.width,
                self.height,
                expected,
                self.data.len()
            )));
        }

        let rgb_data = match self.format {
            PixelFormat::Rgb8 => self.data.as_ref().clone(),
            PixelFormat::Rgba8 => {
                let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);
                for chunk in self.data.chunks_exact(4) {
                    rgb.extend_from_slice(&chunk[..3]); // 跳过 Alpha 通道
                }
                rgb
            }
            PixelFormat::Bgr8 => {
                let mut rgb = Vec::with_capacity(self.data.len());
                for chunk in self.data.chunks_exact(3) {
                    rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
                }
                rgb
            }
        };

        RgbImage::from_raw(self.width, self.height, rgb_data)
            .ok_or_else(|| AnalyzerError::Frame("RGB图像转换失败".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_drops_alpha() {
        let frame = VideoFrame::new(2, 1, PixelFormat::Rgba8, vec![1, 2, 3, 255, 4, 5, 6, 0]);
        let rgb = frame.to_rgb().unwrap();
        assert_eq!(rgb.into_raw(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_bgr_is_swapped() {
        let frame = VideoFrame::new(1, 1, PixelFormat::Bgr8, vec![10, 20, 30]);
        assert_eq!(frame.to_rgb().unwrap().get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_short_buffer_is_frame_error() {
        let frame = VideoFrame::new(4, 4, PixelFormat::Rgb8, vec![0; 10]);
        let err = frame.to_rgb().unwrap_err();
        assert!(matches!(err, AnalyzerError::Frame(_)));
    }
}
