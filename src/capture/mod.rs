// 采集模块 - 管理摄像头句柄的获取与释放

use crate::error::{CoachError, CoachResult};
use crate::models::CaptureConstraints;
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{info, warn};

pub mod directory;
pub mod feed;
pub mod sampler;
pub mod scheduler;

pub use directory::FrameDirectoryDevice;
pub use feed::{FeedPublisher, FrameFeed};
pub use sampler::{Frame, FrameSampler};

/// 正在播放的视频流
pub trait VideoStream: Send + Sync {
    /// 已解码画面的尺寸，尚未就绪时返回 None
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// 当前画面
    fn current_image(&self) -> Option<Arc<DynamicImage>>;

    /// 视频流是否仍在输出（设备拔出或被停止后为 false）
    fn is_live(&self) -> bool;

    /// 停止所有轨道并清空输出，重复调用无副作用
    fn stop(&self);
}

/// 视频设备（按约束打开视频流）
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// 打开视频流，权限被拒或无设备时返回 `CoachError::Device`
    async fn open(&self, constraints: &CaptureConstraints) -> CoachResult<Arc<dyn VideoStream>>;

    fn name(&self) -> &str;
}

/// 摄像头句柄：从获取到释放期间独占设备
///
/// 未显式释放就被丢弃时也会停止视频流
pub struct CaptureHandle {
    stream: Arc<dyn VideoStream>,
    released: bool,
}

impl CaptureHandle {
    fn new(stream: Arc<dyn VideoStream>) -> Self {
        Self {
            stream,
            released: false,
        }
    }

    pub fn stream(&self) -> Arc<dyn VideoStream> {
        self.stream.clone()
    }

    fn release(mut self) {
        self.stream.stop();
        self.released = true;
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if !self.released {
            self.stream.stop();
        }
    }
}

/// 采集源
pub struct CaptureSource {
    device: Arc<dyn CaptureDevice>,
    handle: Option<CaptureHandle>,
}

impl CaptureSource {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            handle: None,
        }
    }

    /// 获取视频流
    ///
    /// 同一时间只持有一个句柄，已持有时先释放旧句柄
    pub async fn acquire(&mut self, constraints: &CaptureConstraints) -> CoachResult<Arc<dyn VideoStream>> {
        if self.handle.is_some() {
            warn!("获取摄像头时仍持有旧句柄，先释放");
            self.release();
        }

        let stream = self.device.open(constraints).await.map_err(|e| match e {
            CoachError::Device(_) => e,
            other => CoachError::Device(other.to_string()),
        })?;

        info!(
            "摄像头已打开: {} (期望分辨率 {}x{})",
            self.device.name(),
            constraints.ideal_width,
            constraints.ideal_height
        );

        let handle = CaptureHandle::new(stream);
        let stream = handle.stream();
        self.handle = Some(handle);
        Ok(stream)
    }

    /// 释放摄像头，未持有时为空操作；返回是否真的释放了句柄
    pub fn release(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.release();
                info!("摄像头已释放: {}", self.device.name());
                true
            }
            None => false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (device, publisher) = FrameFeed::new();
        let mut source = CaptureSource::new(Arc::new(device));

        let stream = source.acquire(&CaptureConstraints::default()).await.unwrap();
        assert!(source.is_held());
        assert!(stream.is_live());

        assert!(source.release());
        assert!(!stream.is_live());
        assert!(!source.release());
        assert!(!publisher.is_streaming());
    }

    #[tokio::test]
    async fn test_denied_device_holds_nothing() {
        let (device, publisher) = FrameFeed::new();
        publisher.deny_permission();
        let mut source = CaptureSource::new(Arc::new(device));

        let result = source.acquire(&CaptureConstraints::default()).await;
        assert!(matches!(result, Err(CoachError::Device(_))));
        assert!(!source.is_held());
    }

    #[tokio::test]
    async fn test_reacquire_replaces_previous_handle() {
        let (device, _publisher) = FrameFeed::new();
        let mut source = CaptureSource::new(Arc::new(device));

        let first = source.acquire(&CaptureConstraints::default()).await.unwrap();
        let second = source.acquire(&CaptureConstraints::default()).await.unwrap();
        assert!(!first.is_live());
        assert!(second.is_live());
    }

    #[tokio::test]
    async fn test_dropping_source_stops_stream() {
        let (device, _publisher) = FrameFeed::new();
        let mut source = CaptureSource::new(Arc::new(device));
        let stream = source.acquire(&CaptureConstraints::default()).await.unwrap();

        drop(source);
        assert!(!stream.is_live());
    }
}
