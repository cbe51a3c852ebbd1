use std::os::raw::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, TrySendError};
use rusb::{ffi, Context, DeviceHandle, UsbContext};

use crate::pool::{FramePool, PooledFrame};
use crate::types::monotonic_ns;
use crate::uvc::{
    self, HeaderInfo, SensorProfile, SensorVariant, PAYLOAD_HEADER_SIZE, SENSOR_VID, VIDEO_ENDPOINT,
    VS_INTERFACE,
};
use crate::{Result, TrackerError};

/// Delivered frames hand ownership of the pool buffer to the consumer;
/// dropping the guard returns it.
pub type FrameCallback = Box<dyn FnMut(PooledFrame) + Send>;

const NUM_TRANSFERS: usize = 5;
const SUBMIT_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_micros(500);

/// Turns isochronous payloads into complete video frames.
///
/// Owns the per-stream assembly state: the current frame, the frame-id
/// parity of the last payload, the current presentation timestamp, and the
/// skip flag raised when the pool underflows or a frame overflows.
pub struct Assembler {
    pool: FramePool,
    frame_cb: FrameCallback,
    frame_size: usize,
    clock_freq: Option<u32>,
    cur_frame: Option<PooledFrame>,
    frame_id: Option<bool>,
    cur_pts: u32,
    frame_collected: usize,
    skip_frame: bool,
}

impl Assembler {
    pub fn new(pool: FramePool, profile: &SensorProfile, frame_cb: FrameCallback) -> Self {
        Self {
            pool,
            frame_cb,
            frame_size: profile.frame_size,
            clock_freq: profile.clock_frequency,
            cur_frame: None,
            frame_id: None,
            cur_pts: 0,
            frame_collected: 0,
            skip_frame: false,
        }
    }

    /// Feed one isochronous payload through the assembly state machine.
    pub fn process_payload(&mut self, payload: &[u8]) {
        // Empty and header-only payloads carry no image data.
        if payload.is_empty() || payload.len() == PAYLOAD_HEADER_SIZE {
            return;
        }
        let Some(header) = uvc::parse_payload_header(payload) else {
            log::warn!("malformed UVC payload header, ignoring payload");
            return;
        };
        if header.info.contains(HeaderInfo::ERROR) {
            log::warn!("UVC payload error bit set, ignoring payload");
            return;
        }

        if header.info.contains(HeaderInfo::PTS) {
            if self.frame_collected > 0 && header.pts != self.cur_pts {
                match self.clock_freq {
                    Some(freq) => {
                        let ms_lost =
                            (header.pts as i64 - self.cur_pts as i64 * 1000) / freq as i64;
                        log::warn!(
                            "mid-frame PTS change {} -> {} ({} ms lost)",
                            self.cur_pts,
                            header.pts,
                            ms_lost
                        );
                    }
                    None => {
                        log::warn!("mid-frame PTS change {} -> {}", self.cur_pts, header.pts)
                    }
                }
                if let Some(frame) = self.cur_frame.as_mut() {
                    frame.pts = header.pts;
                }
            }
            self.cur_pts = header.pts;
        }

        let parity = header.info.contains(HeaderInfo::FRAME_ID);
        if self.frame_id != Some(parity) {
            if self.frame_collected > 0 {
                log::warn!(
                    "short frame dropped ({} of {} bytes)",
                    self.frame_collected,
                    self.frame_size
                );
                self.cur_frame = None;
            }
            self.frame_id = Some(parity);
            self.frame_collected = 0;
            match self.pool.acquire() {
                Some(mut frame) => {
                    frame.start_ts = monotonic_ns();
                    frame.pts = self.cur_pts;
                    self.cur_frame = Some(frame);
                    self.skip_frame = false;
                }
                None => {
                    log::warn!("no free frame, skipping camera frame");
                    self.cur_frame = None;
                    self.skip_frame = true;
                }
            }
        }

        if !self.skip_frame && self.cur_frame.is_some() {
            let body = &payload[PAYLOAD_HEADER_SIZE..];
            if self.frame_collected + body.len() > self.frame_size {
                log::warn!(
                    "frame overflow ({} + {} > {}), dropping frame",
                    self.frame_collected,
                    body.len(),
                    self.frame_size
                );
                self.cur_frame = None;
                self.frame_collected = 0;
                self.skip_frame = true;
            } else {
                let frame = self.cur_frame.as_mut().unwrap();
                frame.data[self.frame_collected..self.frame_collected + body.len()]
                    .copy_from_slice(body);
                self.frame_collected += body.len();
                if self.frame_collected == self.frame_size {
                    let finished = self.cur_frame.take().unwrap();
                    (self.frame_cb)(finished);
                    self.frame_collected = 0;
                }
            }
        }

        // Some sensor firmware sets EOF, some relies on the parity toggle.
        if header.info.contains(HeaderInfo::END_OF_FRAME) {
            self.frame_collected = 0;
        }
    }
}

#[cfg(test)]
impl Assembler {
    fn collected(&self) -> usize {
        self.frame_collected
    }

    fn current_pts(&self) -> u32 {
        self.cur_pts
    }

    fn is_skipping(&self) -> bool {
        self.skip_frame
    }
}

struct StreamShared {
    assembler: Mutex<Assembler>,
    video_running: AtomicBool,
    active_transfers: AtomicUsize,
}

/// Per-transfer state. Heap-pinned for the whole life of the stream: the
/// libusb transfer keeps raw pointers into `buffer`, so the block must not
/// move or drop between submit and completion.
struct TransferBlock {
    shared: Arc<StreamShared>,
    buffer: Vec<u8>,
    packet_size: usize,
    num_packets: usize,
}

extern "system" fn iso_transfer_done(xfer: *mut ffi::libusb_transfer) {
    let block = unsafe { &mut *((*xfer).user_data as *mut TransferBlock) };
    let shared = Arc::clone(&block.shared);

    if !shared.video_running.load(Ordering::Acquire) {
        shared.active_transfers.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    let status = unsafe { (*xfer).status };
    if status == ffi::constants::LIBUSB_TRANSFER_COMPLETED {
        let mut assembler = shared.assembler.lock().unwrap();
        for i in 0..block.num_packets {
            let desc = unsafe { &*(*xfer).iso_packet_desc.as_ptr().add(i) };
            if desc.status != ffi::constants::LIBUSB_TRANSFER_COMPLETED {
                log::trace!("iso packet {} completed with status {}", i, desc.status);
                continue;
            }
            let offset = i * block.packet_size;
            let len = (desc.actual_length as usize).min(block.packet_size);
            assembler.process_payload(&block.buffer[offset..offset + len]);
        }
    } else {
        log::warn!("iso transfer completed with status {}", status);
    }

    for attempt in 1..=SUBMIT_RETRIES {
        let rc = unsafe { ffi::libusb_submit_transfer(xfer) };
        if rc == 0 {
            return;
        }
        if attempt < SUBMIT_RETRIES {
            std::thread::sleep(RETRY_DELAY);
        } else {
            log::warn!("iso transfer resubmission failed ({}), retiring transfer", rc);
        }
    }
    shared.active_transfers.fetch_sub(1, Ordering::AcqRel);
}

/// A set of in-flight isochronous transfers feeding an [`Assembler`].
///
/// Completion callbacks run on the tracker's USB event thread, which is
/// also the only thread that re-submits, so transfer state needs no
/// synchronization of its own.
struct IsoStream {
    handle: Arc<DeviceHandle<Context>>,
    shared: Arc<StreamShared>,
    transfers: Vec<*mut ffi::libusb_transfer>,
    stopped: bool,
}

// The raw transfer pointers are owned by this stream and only dereferenced
// on the USB event thread or after the drain completes.
unsafe impl Send for IsoStream {}

impl IsoStream {
    fn start(
        handle: Arc<DeviceHandle<Context>>,
        profile: &'static SensorProfile,
        assembler: Assembler,
    ) -> Result<IsoStream> {
        handle.set_alternate_setting(VS_INTERFACE, profile.alt_setting)?;

        let packet_size = profile.packet_size;
        let num_packets =
            (profile.frame_size + packet_size * NUM_TRANSFERS - 1) / (packet_size * NUM_TRANSFERS);

        let shared = Arc::new(StreamShared {
            assembler: Mutex::new(assembler),
            video_running: AtomicBool::new(true),
            active_transfers: AtomicUsize::new(0),
        });

        let mut stream = IsoStream {
            handle: Arc::clone(&handle),
            shared: Arc::clone(&shared),
            transfers: Vec::with_capacity(NUM_TRANSFERS),
            stopped: false,
        };

        for _ in 0..NUM_TRANSFERS {
            let mut block = Box::new(TransferBlock {
                shared: Arc::clone(&shared),
                buffer: vec![0u8; num_packets * packet_size],
                packet_size,
                num_packets,
            });

            let xfer = unsafe { ffi::libusb_alloc_transfer(num_packets as c_int) };
            if xfer.is_null() {
                stream.stop();
                return Err(TrackerError::StreamSetup("transfer allocation failed".into()));
            }
            unsafe {
                (*xfer).dev_handle = handle.as_raw();
                (*xfer).endpoint = VIDEO_ENDPOINT;
                (*xfer).transfer_type = ffi::constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
                (*xfer).timeout = 0;
                (*xfer).buffer = block.buffer.as_mut_ptr();
                (*xfer).length = (num_packets * packet_size) as c_int;
                (*xfer).num_iso_packets = num_packets as c_int;
                (*xfer).callback = iso_transfer_done;
                let descs = (*xfer).iso_packet_desc.as_mut_ptr();
                for i in 0..num_packets {
                    (*descs.add(i)).length = packet_size as c_uint;
                    (*descs.add(i)).actual_length = 0;
                    (*descs.add(i)).status = 0;
                }
                (*xfer).user_data = Box::into_raw(block) as *mut c_void;
            }

            let rc = unsafe { ffi::libusb_submit_transfer(xfer) };
            if rc != 0 {
                unsafe {
                    drop(Box::from_raw((*xfer).user_data as *mut TransferBlock));
                    ffi::libusb_free_transfer(xfer);
                }
                stream.stop();
                return Err(TrackerError::StreamSetup(format!(
                    "iso transfer submission failed ({})",
                    rc
                )));
            }
            shared.active_transfers.fetch_add(1, Ordering::AcqRel);
            stream.transfers.push(xfer);
        }

        log::info!(
            "iso stream running: {} transfers x {} packets x {} bytes",
            NUM_TRANSFERS,
            num_packets,
            packet_size
        );
        Ok(stream)
    }

    /// Cooperative shutdown: stop accepting payloads, drop the interface to
    /// alt-setting 0, then let the USB event thread drain completions until
    /// every transfer has retired.
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.video_running.store(false, Ordering::Release);
        if let Err(e) = self.handle.set_alternate_setting(VS_INTERFACE, 0) {
            log::warn!("failed to reset alt setting: {}", e);
        }
        for &xfer in &self.transfers {
            unsafe {
                ffi::libusb_cancel_transfer(xfer);
            }
        }
        while self.shared.active_transfers.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        for xfer in self.transfers.drain(..) {
            unsafe {
                drop(Box::from_raw((*xfer).user_data as *mut TransferBlock));
                ffi::libusb_free_transfer(xfer);
            }
        }
    }
}

impl Drop for IsoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An open constellation sensor delivering assembled video frames.
pub struct VideoStream {
    profile: &'static SensorProfile,
    pool: FramePool,
    iso: IsoStream,
}

impl VideoStream {
    /// Find the first supported sensor on the bus, negotiate its stream
    /// parameters and start capturing. Setup failures tear everything down
    /// and surface as errors.
    pub fn open(ctx: &Context, min_frames: usize, frame_cb: FrameCallback) -> Result<VideoStream> {
        let (device, variant) = find_sensor(ctx)?;
        let profile = variant.profile();

        let handle = device.open()?;
        if handle.kernel_driver_active(VS_INTERFACE).unwrap_or(false) {
            handle.detach_kernel_driver(VS_INTERFACE)?;
        }
        handle.claim_interface(0)?;
        handle.claim_interface(VS_INTERFACE)?;

        if profile.variant == SensorVariant::Dk2 {
            uvc::esp570_setup_unknown_3(&handle)?;
        }
        uvc::negotiate(&handle, profile)?;

        let pool = FramePool::new(min_frames, profile.width, profile.width, profile.height);
        let assembler = Assembler::new(pool.clone(), profile, frame_cb);
        let iso = IsoStream::start(Arc::new(handle), profile, assembler)?;

        log::info!(
            "video stream started: {:?} ({} pool frames)",
            profile.variant,
            min_frames
        );
        Ok(VideoStream { profile, pool, iso })
    }

    pub fn profile(&self) -> &'static SensorProfile {
        self.profile
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Stop the stream. Must be called while the tracker's USB event thread
    /// is still pumping; the drain depends on it.
    pub fn stop(&mut self) {
        self.iso.stop();
    }
}

fn find_sensor(ctx: &Context) -> Result<(rusb::Device<Context>, SensorVariant)> {
    for device in ctx.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if desc.vendor_id() != SENSOR_VID {
            continue;
        }
        match SensorVariant::from_pid(desc.product_id()) {
            Some(variant) => return Ok((device, variant)),
            None => {
                log::warn!("skipping unsupported sensor PID={:04x}", desc.product_id());
            }
        }
    }
    Err(TrackerError::SensorNotFound)
}

/// Receiving side of a bounded frame hand-off channel.
pub struct FrameReceiver {
    rx: Receiver<PooledFrame>,
}

impl FrameReceiver {
    /// Receive the next assembled frame (blocks until available).
    pub fn recv(&self) -> Result<PooledFrame> {
        self.rx.recv().map_err(|_| TrackerError::StreamStopped)
    }

    /// Try to receive a frame without blocking.
    pub fn try_recv(&self) -> Option<PooledFrame> {
        self.rx.try_recv().ok()
    }

    /// Receive a frame with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<PooledFrame> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => TrackerError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => TrackerError::StreamStopped,
        })
    }
}

/// Build a frame callback that forwards frames into a bounded channel,
/// dropping (and thereby recycling) frames when the consumer lags.
pub fn frame_channel(capacity: usize) -> (FrameCallback, FrameReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let cb: FrameCallback = Box::new(move |frame: PooledFrame| match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            log::trace!("frame channel full, dropping frame");
        }
        Err(TrySendError::Disconnected(_)) => {
            log::debug!("frame channel disconnected, dropping frame");
        }
    });
    (cb, FrameReceiver { rx })
}
