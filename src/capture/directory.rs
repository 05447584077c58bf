// 目录回放视频源 - 按文件名顺序循环播放目录中的图片
//
// 用于无摄像头环境下的演示与联调

use super::{CaptureDevice, VideoStream};
use crate::error::{CoachError, CoachResult};
use crate::models::CaptureConstraints;
use async_trait::async_trait;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, trace, warn};

const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 目录回放设备
pub struct FrameDirectoryDevice {
    dir: PathBuf,
    name: String,
}

impl FrameDirectoryDevice {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = format!("directory:{}", dir.display());
        Self { dir, name }
    }

    /// 列出目录中的图片，按文件名排序
    async fn list_frames(&self) -> CoachResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| CoachError::Device(format!("无法读取帧目录 {:?}: {}", self.dir, e)))?;

        let mut frames = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoachError::Device(format!("遍历帧目录失败: {}", e)))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
            if SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| extension.eq_ignore_ascii_case(supported))
            {
                frames.push(path);
            }
        }

        frames.sort();
        Ok(frames)
    }
}

/// 按期望分辨率缩放（只缩小，保持宽高比）
fn fit_to_constraints(image: DynamicImage, constraints: &CaptureConstraints) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if width <= constraints.ideal_width && height <= constraints.ideal_height {
        return image;
    }
    image.resize(
        constraints.ideal_width,
        constraints.ideal_height,
        image::imageops::FilterType::Triangle,
    )
}

fn load_frame(path: &Path, constraints: &CaptureConstraints) -> Option<DynamicImage> {
    match image::open(path) {
        Ok(image) => Some(fit_to_constraints(image, constraints)),
        Err(e) => {
            warn!("读取帧文件失败 {:?}: {}", path, e);
            None
        }
    }
}

#[async_trait]
impl CaptureDevice for FrameDirectoryDevice {
    async fn open(&self, constraints: &CaptureConstraints) -> CoachResult<Arc<dyn VideoStream>> {
        let frames = self.list_frames().await?;
        let Some(first_path) = frames.first() else {
            return Err(CoachError::Device(format!("帧目录中没有图片: {:?}", self.dir)));
        };

        let path = first_path.clone();
        let wanted = *constraints;
        let first = tokio::task::spawn_blocking(move || load_frame(&path, &wanted))
            .await
            .ok()
            .flatten()
            .ok_or_else(|| CoachError::Device(format!("无法解码首帧: {:?}", first_path)))?;
        let dimensions = (first.width(), first.height());

        info!(
            "目录回放已打开: {} 帧, 分辨率 {}x{}",
            frames.len(),
            dimensions.0,
            dimensions.1
        );

        Ok(Arc::new(DirectoryStream {
            frames,
            cursor: AtomicUsize::new(0),
            constraints: *constraints,
            dimensions,
            live: AtomicBool::new(true),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct DirectoryStream {
    frames: Vec<PathBuf>,
    cursor: AtomicUsize,
    constraints: CaptureConstraints,
    dimensions: (u32, u32),
    live: AtomicBool,
}

impl VideoStream for DirectoryStream {
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.is_live().then_some(self.dimensions)
    }

    // 同步解码，由采样器在阻塞线程池中调用
    fn current_image(&self) -> Option<Arc<DynamicImage>> {
        if !self.is_live() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.frames.len();
        let path = &self.frames[index];
        trace!("回放帧 #{}: {:?}", index, path);
        load_frame(path, &self.constraints).map(Arc::new)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}
