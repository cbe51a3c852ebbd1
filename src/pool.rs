use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// One pre-allocated video frame buffer.
///
/// `data.len() == stride * height` for the stream's negotiated resolution,
/// for the whole life of the pool.
#[derive(Debug)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub stride: usize,
    pub width: usize,
    pub height: usize,
    /// Camera-clock presentation timestamp of the frame.
    pub pts: u32,
    /// Host monotonic time the first payload of the frame arrived, in ns.
    pub start_ts: u64,
    /// Index of this frame's slot in its pool.
    pub pool_index: usize,
}

impl VideoFrame {
    pub fn data_size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug)]
struct PoolShared {
    free: Vec<Box<VideoFrame>>,
    total: usize,
}

/// Fixed-count pool of video frames, sized once at stream start.
///
/// Acquisition never blocks: when the free list is empty the caller is
/// expected to skip the in-progress camera frame. Frames return to the pool
/// when their [`PooledFrame`] guard drops.
#[derive(Debug, Clone)]
pub struct FramePool {
    shared: Arc<Mutex<PoolShared>>,
}

impl FramePool {
    pub fn new(min_frames: usize, stride: usize, width: usize, height: usize) -> Self {
        let free = (0..min_frames)
            .map(|pool_index| {
                Box::new(VideoFrame {
                    data: vec![0u8; stride * height],
                    stride,
                    width,
                    height,
                    pts: 0,
                    start_ts: 0,
                    pool_index,
                })
            })
            .collect();
        Self {
            shared: Arc::new(Mutex::new(PoolShared {
                free,
                total: min_frames,
            })),
        }
    }

    /// Pop a frame from the free list, or `None` when the pool is drained.
    pub fn acquire(&self) -> Option<PooledFrame> {
        let frame = self.shared.lock().unwrap().free.pop()?;
        Some(PooledFrame {
            frame: Some(frame),
            pool: self.clone(),
        })
    }

    fn release(&self, frame: Box<VideoFrame>) {
        let mut shared = self.shared.lock().unwrap();
        debug_assert!(shared.free.len() < shared.total);
        shared.free.push(frame);
    }

    pub fn free_count(&self) -> usize {
        self.shared.lock().unwrap().free.len()
    }

    pub fn total(&self) -> usize {
        self.shared.lock().unwrap().total
    }
}

/// Owning guard over a pool frame. Dropping it anywhere returns the buffer
/// to its pool, so a consumer cannot leak pool capacity.
#[derive(Debug)]
pub struct PooledFrame {
    frame: Option<Box<VideoFrame>>,
    pool: FramePool,
}

impl Deref for PooledFrame {
    type Target = VideoFrame;

    fn deref(&self) -> &VideoFrame {
        self.frame.as_ref().unwrap()
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut VideoFrame {
        self.frame.as_mut().unwrap()
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.release(frame);
        }
    }
}
