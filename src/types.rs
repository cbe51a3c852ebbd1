use std::sync::OnceLock;
use std::time::Instant;

use nalgebra::{Isometry3, Vector3};

// -- Core sizing parameters --

/// Maximum number of concurrently outstanding camera exposures awaiting a
/// retroactive correction, per tracked device.
pub const NUM_DELAY_SLOTS: usize = 3;

/// Maximum number of constellation sensors (and thus pose reports per slot).
pub const MAX_SENSORS: usize = 4;

/// Pending IMU observation ring capacity before a forced telemetry flush.
pub const PENDING_IMU_CAPACITY: usize = 1000;

// -- Timing thresholds --

/// Without a positional observation for this long, the reported position
/// freezes and velocities are clamped to zero.
pub const POSE_LOST_THRESHOLD_NS: u64 = 500_000_000;

/// Without an orientation match for this long, a weak orientation
/// observation is accepted anyway.
pub const ORIENT_REFRESH_THRESHOLD_NS: u64 = 100_000_000;

bitflags::bitflags! {
    /// Match quality flags attached to a candidate pose by the vision
    /// pipeline's constellation search.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoseMatch: u32 {
        const GOOD     = 1 << 0;
        const POSITION = 1 << 1;
        const ORIENT   = 1 << 2;
        const STRONG   = 1 << 3;
    }
}

/// One inertial observation, timestamped in both clock domains.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Host monotonic time the report arrived, in nanoseconds.
    pub local_ts: u64,
    /// Extended device-clock time, in nanoseconds.
    pub device_ts: u64,
    /// Integration interval, in seconds.
    pub dt: f64,
    pub ang_vel: Vector3<f64>,
    pub accel: Vector3<f64>,
    pub mag: Vector3<f64>,
}

/// Per-device snapshot taken when an exposure event arrives.
#[derive(Debug, Clone)]
pub struct ExposureDeviceInfo {
    pub device_id: u32,
    /// Device-clock time at the moment the exposure event arrived.
    pub device_time_ns: u64,
    /// Delay slot allocated for this exposure, or -1 if none was available.
    pub fusion_slot: i32,
    /// Whether the device had a recent positional observation at exposure time.
    pub had_pose_lock: bool,
    /// Filter-predicted fusion pose at exposure time.
    pub capture_pose: Isometry3<f64>,
    /// Positional standard deviation of the prediction, per axis.
    pub pos_error: Vector3<f64>,
    /// Rotational standard deviation of the prediction, per axis.
    pub rot_error: Vector3<f64>,
}

impl ExposureDeviceInfo {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            device_time_ns: 0,
            fusion_slot: -1,
            had_pose_lock: false,
            capture_pose: Isometry3::identity(),
            pos_error: Vector3::zeros(),
            rot_error: Vector3::zeros(),
        }
    }
}

/// Snapshot of the most recent exposure event. Immutable after publication;
/// readers receive a by-value copy taken under the tracker lock.
#[derive(Debug, Clone)]
pub struct ExposureInfo {
    /// Host monotonic time the exposure event was observed, in nanoseconds.
    pub local_ts: u64,
    /// HMD-clock timestamp of the exposure.
    pub hmd_ts: u32,
    /// Monotonic exposure counter reported by the HMD.
    pub count: u16,
    /// LED blink pattern phase at the exposure.
    pub led_pattern_phase: u8,
    pub devices: Vec<ExposureDeviceInfo>,
}

// -- Host clock --

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Host monotonic time in nanoseconds, from a process-wide epoch.
pub fn monotonic_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
