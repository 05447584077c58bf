// 帧采样 - 从视频流中截取一张静态图片并编码为 JPEG

use super::VideoStream;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use tracing::{trace, warn};

/// 截取的单帧（只在一个分析周期内存在）
#[derive(Clone, Debug)]
pub struct Frame {
    /// JPEG 数据
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// 帧采样器
#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
    quality: u8,
}

impl FrameSampler {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    /// 截取当前画面
    ///
    /// 视频流尚未解码出画面时返回 None，调用方应跳过本周期
    pub fn sample(&self, stream: &dyn VideoStream) -> Option<Frame> {
        let (width, height) = stream.dimensions()?;
        if width == 0 || height == 0 {
            trace!("视频流尚未就绪，跳过采样");
            return None;
        }

        let image = stream.current_image()?;
        // 按原始分辨率编码，JPEG 不支持透明通道
        let rgb = image.to_rgb8();

        let mut data = Vec::new();
        let encoded = JpegEncoder::new_with_quality(&mut data, self.quality).encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ColorType::Rgb8,
        );
        if let Err(e) = encoded {
            warn!("帧编码失败: {}", e);
            return None;
        }

        Some(Frame {
            data,
            width: rgb.width(),
            height: rgb.height(),
            captured_at: Utc::now(),
        })
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(80)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::sync::Arc;

    struct StillStream(Option<Arc<DynamicImage>>);

    impl VideoStream for StillStream {
        fn dimensions(&self) -> Option<(u32, u32)> {
            self.0.as_ref().map(|image| (image.width(), image.height()))
        }

        fn current_image(&self) -> Option<Arc<DynamicImage>> {
            self.0.clone()
        }

        fn is_live(&self) -> bool {
            true
        }

        fn stop(&self) {}
    }

    #[test]
    fn test_sample_encodes_jpeg_at_native_size() {
        let stream = StillStream(Some(Arc::new(DynamicImage::new_rgba8(40, 30))));
        let frame = FrameSampler::default().sample(&stream).unwrap();

        assert_eq!((frame.width, frame.height), (40, 30));
        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&frame.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[test]
    fn test_not_ready_stream_yields_no_frame() {
        let stream = StillStream(None);
        assert!(FrameSampler::default().sample(&stream).is_none());
    }

    #[test]
    fn test_quality_is_clamped() {
        assert_eq!(FrameSampler::new(0).quality, 1);
        assert_eq!(FrameSampler::new(255).quality, 100);
    }
}
