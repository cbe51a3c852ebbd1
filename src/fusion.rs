use nalgebra::{Isometry3, Vector3};

/// Filter state reported for a query time: the fusion (IMU) frame's pose in
/// world coordinates and its derivatives, all in the fusion frame.
#[derive(Debug, Clone, Copy)]
pub struct FilterState {
    pub pose: Isometry3<f64>,
    pub linear_velocity: Vector3<f64>,
    pub linear_accel: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

impl FilterState {
    pub fn at_rest(pose: Isometry3<f64>) -> Self {
        Self {
            pose,
            linear_velocity: Vector3::zeros(),
            linear_accel: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
        }
    }
}

/// Per-axis standard deviations of a predicted pose.
#[derive(Debug, Clone, Copy)]
pub struct PoseError {
    pub pos: Vector3<f64>,
    pub rot: Vector3<f64>,
}

/// The operation set the tracker core invokes on the 6-DoF pose filter.
///
/// The filter itself is an external collaborator; the core only requires
/// that corrections tagged with a delay slot revise the state retroactively
/// from that slot's prepared time forward, and that IMU updates arrive in
/// device-time order (the caller serializes them under the device lock).
pub trait PoseFilter: Send {
    /// Initialize the filter with the device's starting pose estimate and
    /// the number of delay slots the core will anchor. Called once, when
    /// the device is registered with the tracker.
    fn init(&mut self, initial_pose: &Isometry3<f64>, num_delay_slots: usize);

    /// Integrate one inertial observation at the given device time.
    fn imu_update(
        &mut self,
        time_ns: u64,
        dt: f64,
        ang_vel: &Vector3<f64>,
        accel: &Vector3<f64>,
        mag: &Vector3<f64>,
    );

    /// Apply a position-only correction anchored at a delay slot.
    fn position_update(&mut self, slot_id: usize, position: &Vector3<f64>);

    /// Apply a full pose correction anchored at a delay slot.
    fn pose_update(&mut self, slot_id: usize, pose: &Isometry3<f64>);

    /// Anchor a delay slot at the given device time so later corrections
    /// can revise the state from that moment forward.
    fn prepare_delay_slot(&mut self, slot_id: usize, time_ns: u64);

    /// Drop the constraint held by a delay slot.
    fn release_delay_slot(&mut self, slot_id: usize);

    /// Query the filtered state at the given device time.
    fn state_at(&mut self, time_ns: u64) -> FilterState;

    /// Query the predicted fusion pose and its covariance summary at the
    /// given device time.
    fn predicted_pose(&mut self, time_ns: u64) -> (Isometry3<f64>, PoseError);
}
