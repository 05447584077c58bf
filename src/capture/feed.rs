// 推送式视频源 - 显示层把解码后的画面推送进来
//
// 显示层负责真正的摄像头（例如浏览器的 getUserMedia），
// 这里只保存最新一帧，调度器采样时读取

use super::{CaptureDevice, VideoStream};
use crate::error::{CoachError, CoachResult};
use crate::models::CaptureConstraints;
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

struct FeedShared {
    /// 最新一帧
    latest: RwLock<Option<Arc<DynamicImage>>>,
    /// 当前打开的流的代数，0 表示没有打开的流
    generation: AtomicU64,
    next_generation: AtomicU64,
    permission_granted: AtomicBool,
    connected: AtomicBool,
    requested: RwLock<Option<CaptureConstraints>>,
}

impl FeedShared {
    fn close(&self, generation: u64) {
        // 只关闭自己那一代的流
        if self
            .generation
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Ok(mut latest) = self.latest.write() {
                *latest = None;
            }
            if let Ok(mut requested) = self.requested.write() {
                *requested = None;
            }
        }
    }
}

/// 推送式视频设备
pub struct FrameFeed {
    shared: Arc<FeedShared>,
}

/// 推送端（由显示层持有）
#[derive(Clone)]
pub struct FeedPublisher {
    shared: Arc<FeedShared>,
}

impl FrameFeed {
    pub fn new() -> (Self, FeedPublisher) {
        let shared = Arc::new(FeedShared {
            latest: RwLock::new(None),
            generation: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
            permission_granted: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            requested: RwLock::new(None),
        });
        (
            Self {
                shared: shared.clone(),
            },
            FeedPublisher { shared },
        )
    }
}

impl FeedPublisher {
    /// 推送一帧；没有打开的流时丢弃
    pub fn push(&self, image: DynamicImage) -> bool {
        if self.shared.generation.load(Ordering::SeqCst) == 0 {
            trace!("没有打开的视频流，丢弃推送的画面");
            return false;
        }
        if let Ok(mut latest) = self.shared.latest.write() {
            *latest = Some(Arc::new(image));
            return true;
        }
        false
    }

    /// 当前流请求的分辨率
    pub fn requested_constraints(&self) -> Option<CaptureConstraints> {
        self.shared.requested.read().ok().and_then(|c| *c)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) != 0
    }

    pub fn deny_permission(&self) {
        self.shared.permission_granted.store(false, Ordering::SeqCst);
    }

    pub fn grant_permission(&self) {
        self.shared.permission_granted.store(true, Ordering::SeqCst);
    }

    /// 设备断开，正在进行的流随之结束
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        let current = self.shared.generation.load(Ordering::SeqCst);
        if current != 0 {
            self.shared.close(current);
        }
        debug!("推送式视频设备已断开");
    }

    pub fn reconnect(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureDevice for FrameFeed {
    async fn open(&self, constraints: &CaptureConstraints) -> CoachResult<Arc<dyn VideoStream>> {
        if !self.shared.permission_granted.load(Ordering::SeqCst) {
            return Err(CoachError::Device("摄像头权限被拒绝".to_string()));
        }
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(CoachError::Device("未找到可用摄像头".to_string()));
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        if self
            .shared
            .generation
            .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoachError::Device("摄像头正被占用".to_string()));
        }

        if let Ok(mut requested) = self.shared.requested.write() {
            *requested = Some(*constraints);
        }

        Ok(Arc::new(FeedStream {
            shared: self.shared.clone(),
            generation,
        }))
    }

    fn name(&self) -> &str {
        "frame-feed"
    }
}

struct FeedStream {
    shared: Arc<FeedShared>,
    generation: u64,
}

impl VideoStream for FeedStream {
    fn dimensions(&self) -> Option<(u32, u32)> {
        let image = self.current_image()?;
        Some((image.width(), image.height()))
    }

    fn current_image(&self) -> Option<Arc<DynamicImage>> {
        if !self.is_live() {
            return None;
        }
        self.shared.latest.read().ok().and_then(|latest| latest.clone())
    }

    fn is_live(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    fn stop(&self) {
        self.shared.close(self.generation);
    }
}
