use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nalgebra::Isometry3;
use rusb::{Context, UsbContext};

use crate::device::{DeviceConfig, TelemetrySink, TrackedDevice};
use crate::fusion::PoseFilter;
use crate::pool::VideoFrame;
use crate::pose::ViewPose;
use crate::stream::{FrameCallback, VideoStream};
use crate::types::{monotonic_ns, ExposureDeviceInfo, ExposureInfo, NUM_DELAY_SLOTS};
use crate::{Result, TrackerError};

/// Receives exposure snapshots, outside the tracker lock. Implementations
/// typically enqueue work for a sensor's vision thread and may call back
/// into the tracker.
pub trait SensorNotify: Send + Sync {
    fn on_exposure(&self, info: &ExposureInfo);
}

struct TrackerState {
    exposure: Option<ExposureInfo>,
    devices: Vec<Arc<TrackedDevice>>,
    sensors: Vec<Arc<dyn SensorNotify>>,
}

struct TrackerShared {
    ctx: Context,
    shutdown: AtomicBool,
    state: Mutex<TrackerState>,
}

/// The tracker coordinates tracked devices, constellation sensors and the
/// USB event pump.
///
/// Lock order is tracker state first, then any device lock; no lock is held
/// across sensor callbacks. Stop any [`VideoStream`] before dropping the
/// tracker: the stream drain relies on the event thread still pumping.
pub struct Tracker {
    shared: Arc<TrackerShared>,
    usb_thread: Option<JoinHandle<()>>,
}

impl Tracker {
    pub fn new() -> Result<Tracker> {
        let ctx = Context::new()?;
        let shared = Arc::new(TrackerShared {
            ctx,
            shutdown: AtomicBool::new(false),
            state: Mutex::new(TrackerState {
                exposure: None,
                devices: Vec::new(),
                sensors: Vec::new(),
            }),
        });

        let thread_shared = Arc::clone(&shared);
        let usb_thread = std::thread::Builder::new()
            .name("constellation-usb".into())
            .spawn(move || usb_event_loop(thread_shared))
            .map_err(|e| TrackerError::StreamSetup(format!("failed to spawn USB thread: {}", e)))?;

        Ok(Tracker {
            shared,
            usb_thread: Some(usb_thread),
        })
    }

    /// Register a tracked device with its calibration, pose filter and
    /// telemetry sink. The filter is initialized here, before the device
    /// can receive IMU or exposure traffic.
    pub fn add_device(
        &self,
        config: DeviceConfig,
        mut filter: Box<dyn PoseFilter>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Arc<TrackedDevice> {
        filter.init(&Isometry3::identity(), NUM_DELAY_SLOTS);
        let mut st = self.shared.state.lock().unwrap();
        let index = st.devices.len();
        let device = Arc::new(TrackedDevice::new(config, index, filter, telemetry));
        st.devices.push(Arc::clone(&device));
        log::info!("tracked device {} registered (index {})", device.id(), index);
        device
    }

    pub fn device(&self, id: u32) -> Option<Arc<TrackedDevice>> {
        let st = self.shared.state.lock().unwrap();
        st.devices.iter().find(|d| d.id() == id).cloned()
    }

    /// Register a sensor for exposure fan-out.
    pub fn add_sensor(&self, sensor: Arc<dyn SensorNotify>) {
        self.shared.state.lock().unwrap().sensors.push(sensor);
    }

    /// Open the first supported constellation sensor and start its video
    /// stream, serviced by this tracker's event thread.
    pub fn start_video_stream(
        &self,
        min_frames: usize,
        frame_cb: FrameCallback,
    ) -> Result<VideoStream> {
        VideoStream::open(&self.shared.ctx, min_frames, frame_cb)
    }

    /// Handle the exposure fields embedded in an HMD IMU report.
    ///
    /// Advances the exposure record only when the counter changed; replays
    /// of the same count are no-ops. Each device snapshots its state and
    /// allocates a delay slot under its own lock, then sensors are notified
    /// outside the tracker lock.
    pub fn on_exposure(&self, exposure_count: u16, exposure_hmd_ts: u32, led_pattern_phase: u8) {
        let (snapshot, sensors) = {
            let mut st = self.shared.state.lock().unwrap();
            if st.exposure.as_ref().map(|e| e.count) == Some(exposure_count) {
                return;
            }
            let mut info = ExposureInfo {
                local_ts: monotonic_ns(),
                hmd_ts: exposure_hmd_ts,
                count: exposure_count,
                led_pattern_phase,
                devices: Vec::with_capacity(st.devices.len()),
            };
            for device in &st.devices {
                let mut dev_info = ExposureDeviceInfo::new(device.id());
                device.on_exposure(&mut dev_info);
                info.devices.push(dev_info);
            }
            st.exposure = Some(info.clone());
            (info, st.sensors.clone())
        };

        log::trace!(
            "exposure {} at hmd_ts {} phase {}",
            snapshot.count,
            snapshot.hmd_ts,
            snapshot.led_pattern_phase
        );
        for sensor in &sensors {
            sensor.on_exposure(&snapshot);
        }
    }

    /// Latest exposure record, copied by value under the tracker lock.
    pub fn exposure_info(&self) -> Option<ExposureInfo> {
        self.shared.state.lock().unwrap().exposure.clone()
    }

    /// A sensor began processing a frame it attributes to `exposure`: claim
    /// each device's delay slot so the anchors outlive the frame.
    pub fn frame_started(&self, exposure: &ExposureInfo) {
        self.for_each_exposed_device(exposure, |dev, info| dev.claim_slot(info));
    }

    /// A frame finished capture for `exposure`. Returns the capture
    /// latency relative to the exposure event, in microseconds.
    pub fn frame_captured(&self, frame: &VideoFrame, exposure: &ExposureInfo) -> u64 {
        let latency_us = frame.start_ts.saturating_sub(exposure.local_ts) / 1000;
        log::trace!(
            "frame pts {} captured {} us after exposure {}",
            frame.pts,
            latency_us,
            exposure.count
        );
        latency_us
    }

    /// A sensor re-attributed a frame to a different exposure: move the
    /// claims over.
    pub fn frame_changed_exposure(&self, old: &ExposureInfo, new: &ExposureInfo) {
        self.for_each_exposed_device(old, |dev, info| dev.release_slot(info));
        self.for_each_exposed_device(new, |dev, info| dev.claim_slot(info));
    }

    /// A frame is done (vision finished or it was dropped): release the
    /// claims taken at frame start.
    pub fn frame_released(&self, exposure: &ExposureInfo) {
        self.for_each_exposed_device(exposure, |dev, info| dev.release_slot(info));
    }

    /// Current user-visible pose of a tracked device.
    pub fn view_pose(&self, device_id: u32) -> Result<ViewPose> {
        let device = self
            .device(device_id)
            .ok_or(TrackerError::UnknownDevice(device_id))?;
        Ok(device.get_view_pose())
    }

    fn for_each_exposed_device(
        &self,
        exposure: &ExposureInfo,
        f: impl Fn(&TrackedDevice, &ExposureDeviceInfo),
    ) {
        let st = self.shared.state.lock().unwrap();
        for info in &exposure.devices {
            if let Some(device) = st.devices.iter().find(|d| d.id() == info.device_id) {
                f(device, info);
            }
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.usb_thread.take() {
            let _ = thread.join();
        }
    }
}

fn usb_event_loop(shared: Arc<TrackerShared>) {
    log::info!("USB event thread started");
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(e) = shared.ctx.handle_events(Some(Duration::from_millis(100))) {
            log::warn!("USB event handling error: {}", e);
        }
    }
    log::info!("USB event thread stopped");
}
