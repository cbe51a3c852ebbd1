use std::sync::Mutex;

use nalgebra::{Isometry3, Vector3};

use crate::fusion::PoseFilter;
use crate::pose::{DeviceTransforms, ExpFilterPose, ViewPose};
use crate::slots::{DelaySlotTable, PoseReport};
use crate::types::{
    ExposureDeviceInfo, ExposureInfo, ImuSample, PoseMatch, ORIENT_REFRESH_THRESHOLD_NS,
    PENDING_IMU_CAPACITY, POSE_LOST_THRESHOLD_NS,
};

/// Sink for drained IMU observation batches. The transport behind it is
/// not the tracker's concern.
pub trait TelemetrySink: Send {
    fn imu_batch(&mut self, device_id: u32, samples: &[ImuSample]);
}

/// Discards every batch.
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn imu_batch(&mut self, _device_id: u32, _samples: &[ImuSample]) {}
}

/// Rigid calibration of one tracked device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: u32,
    /// IMU frame to device body frame.
    pub device_from_fusion: Isometry3<f64>,
    /// LED constellation model frame to device body frame.
    pub device_from_model: Isometry3<f64>,
}

struct DeviceState {
    filter: Box<dyn PoseFilter>,
    slots: DelaySlotTable,
    transforms: DeviceTransforms,
    last_device_ts: Option<u32>,
    device_time_ns: u64,
    last_reported_pose_ns: u64,
    last_observed_pose_ns: u64,
    last_observed_orient_ns: u64,
    reported_pose: Isometry3<f64>,
    model_pose: Isometry3<f64>,
    output_filter: ExpFilterPose,
    pending_imu: Vec<ImuSample>,
    telemetry: Box<dyn TelemetrySink>,
}

/// One tracked device: the HMD or a controller.
///
/// All mutable state lives behind the device lock. The tracker lock, when
/// needed, is always taken first.
pub struct TrackedDevice {
    id: u32,
    index: usize,
    state: Mutex<DeviceState>,
}

impl TrackedDevice {
    pub fn new(
        config: DeviceConfig,
        index: usize,
        filter: Box<dyn PoseFilter>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Self {
        Self {
            id: config.id,
            index,
            state: Mutex::new(DeviceState {
                filter,
                slots: DelaySlotTable::new(),
                transforms: DeviceTransforms::new(
                    config.device_from_fusion,
                    config.device_from_model,
                ),
                last_device_ts: None,
                device_time_ns: 0,
                last_reported_pose_ns: 0,
                last_observed_pose_ns: 0,
                last_observed_orient_ns: 0,
                reported_pose: Isometry3::identity(),
                model_pose: Isometry3::identity(),
                output_filter: ExpFilterPose::new(),
                pending_imu: Vec::with_capacity(PENDING_IMU_CAPACITY),
                telemetry,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Extended device-clock time of the last IMU update, in nanoseconds.
    pub fn device_time_ns(&self) -> u64 {
        self.state.lock().unwrap().device_time_ns
    }

    /// Integrate one IMU report.
    ///
    /// `raw_device_ts` is the device's 32-bit microsecond timestamp; the
    /// wrapping difference against the previous raw value extends it into
    /// the monotonic 64-bit nanosecond domain, which survives the 32-bit
    /// wrap at ~71.6 minutes.
    pub fn imu_update(
        &self,
        local_ts: u64,
        raw_device_ts: u32,
        dt: f64,
        ang_vel: &Vector3<f64>,
        accel: &Vector3<f64>,
        mag: &Vector3<f64>,
    ) {
        let mut st = self.state.lock().unwrap();
        if let Some(last) = st.last_device_ts {
            let delta_us = raw_device_ts.wrapping_sub(last);
            st.device_time_ns += delta_us as u64 * 1000;
        }
        st.last_device_ts = Some(raw_device_ts);

        let device_ts = st.device_time_ns;
        st.filter.imu_update(device_ts, dt, ang_vel, accel, mag);

        if st.pending_imu.len() >= PENDING_IMU_CAPACITY {
            flush_pending(&mut st, self.id);
        }
        st.pending_imu.push(ImuSample {
            local_ts,
            device_ts,
            dt,
            ang_vel: *ang_vel,
            accel: *accel,
            mag: *mag,
        });
    }

    /// Snapshot this device's part of a new exposure event.
    ///
    /// Called by the tracker with its own lock held; takes the device lock.
    /// Allocates (or reclaims) a delay slot, asks the filter to anchor it,
    /// and records the filter's predicted pose at the exposure moment.
    pub(crate) fn on_exposure(&self, info: &mut ExposureDeviceInfo) {
        let mut st = self.state.lock().unwrap();
        let device_time_ns = st.device_time_ns;
        info.device_time_ns = device_time_ns;

        match st.slots.allocate(device_time_ns) {
            Some(slot_id) => {
                info.fusion_slot = slot_id as i32;
                st.filter.prepare_delay_slot(slot_id, device_time_ns);
            }
            None => {
                info.fusion_slot = -1;
                log::trace!("device {}: no delay slot for exposure", self.id);
            }
        }

        let (capture_pose, err) = st.filter.predicted_pose(device_time_ns);
        info.capture_pose = capture_pose;
        info.pos_error = err.pos;
        info.rot_error = err.rot;
        info.had_pose_lock =
            device_time_ns.saturating_sub(st.last_observed_pose_ns) < POSE_LOST_THRESHOLD_NS;

        flush_pending(&mut st, self.id);
    }

    /// Apply a vision-pipeline pose observation tied to an exposure.
    ///
    /// The observation is time-tagged through its delay slot; the filter
    /// merges it retroactively from the exposure moment forward, so late
    /// and out-of-order arrivals are fine.
    pub fn pose_update(
        &self,
        local_ts: u64,
        exposure: &ExposureInfo,
        score: PoseMatch,
        model_pose: &Isometry3<f64>,
    ) {
        let Some(dev_info) = exposure.devices.iter().find(|d| d.device_id == self.id) else {
            return;
        };

        let mut st = self.state.lock().unwrap();
        let fusion_pose = *model_pose * st.transforms.model_from_fusion;
        let frame_time_ns = dev_info.device_time_ns;

        if dev_info.fusion_slot < 0
            || !st.slots.matches(dev_info.fusion_slot as usize, frame_time_ns)
        {
            log::trace!(
                "device {}: pose report for retired exposure @{} dropped",
                self.id,
                frame_time_ns
            );
            return;
        }
        let slot_id = dev_info.fusion_slot as usize;

        let pos_delta =
            (fusion_pose.translation.vector - dev_info.capture_pose.translation.vector).norm();
        let rot_delta = fusion_pose.rotation.angle_to(&dev_info.capture_pose.rotation);
        log::trace!(
            "device {}: observation @{} delta pos {:.4} rot {:.4} score {:?}",
            self.id,
            frame_time_ns,
            pos_delta,
            rot_delta,
            score
        );

        // A weak positional match is stale once a newer observation has
        // already corrected the filter, but only a device that held pose
        // lock at exposure time applies this check.
        let update_position = !(dev_info.had_pose_lock
            && !score.contains(PoseMatch::POSITION)
            && st.last_observed_pose_ns > frame_time_ns);

        let update_orient = score.contains(PoseMatch::ORIENT)
            || st.device_time_ns.saturating_sub(st.last_observed_orient_ns)
                >= ORIENT_REFRESH_THRESHOLD_NS;

        if update_position && update_orient {
            st.filter.pose_update(slot_id, &fusion_pose);
        } else if update_position {
            st.filter.position_update(slot_id, &fusion_pose.translation.vector);
        }

        if update_position {
            st.last_observed_pose_ns = frame_time_ns;
            st.model_pose = *model_pose;
            if update_orient {
                st.last_observed_orient_ns = frame_time_ns;
            }
        }

        st.slots.record(
            slot_id,
            PoseReport {
                local_ts,
                pose: fusion_pose,
                score,
                used: update_position,
            },
        );
    }

    /// Claim the delay slot backing this exposure for an arriving frame.
    pub(crate) fn claim_slot(&self, dev_info: &ExposureDeviceInfo) {
        if dev_info.fusion_slot < 0 {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.slots
            .claim(dev_info.fusion_slot as usize, dev_info.device_time_ns);
    }

    /// Release one frame's claim; on the last release the filter drops the
    /// slot constraint.
    pub(crate) fn release_slot(&self, dev_info: &ExposureDeviceInfo) {
        if dev_info.fusion_slot < 0 {
            return;
        }
        let mut st = self.state.lock().unwrap();
        let slot_id = dev_info.fusion_slot as usize;
        if st.slots.release(slot_id, dev_info.device_time_ns) {
            st.filter.release_delay_slot(slot_id);
        }
    }

    /// Compute the user-visible device body pose at the current device time.
    pub fn get_view_pose(&self) -> ViewPose {
        let mut st = self.state.lock().unwrap();
        let t = st.device_time_ns;
        let fs = st.filter.state_at(t);

        let device_from_fusion = st.transforms.device_from_fusion;
        let fusion_from_device = device_from_fusion.inverse();
        let mut pose = fs.pose * fusion_from_device;
        let mut lin_vel = fs.linear_velocity;
        let mut lin_accel = fs.linear_accel;

        let position_lost =
            t.saturating_sub(st.last_observed_pose_ns) >= POSE_LOST_THRESHOLD_NS;
        if position_lost {
            pose.translation = st.reported_pose.translation;
            lin_vel = Vector3::zeros();
            lin_accel = Vector3::zeros();
        }

        // Smooth once per distinct device time; repeat queries at the same
        // instant return the already-filtered pose.
        if st.last_reported_pose_ns < t {
            pose = st.output_filter.filter(&pose);
            st.last_reported_pose_ns = t;
            st.reported_pose = pose;
        } else {
            pose = st.reported_pose;
        }

        let rot_df = device_from_fusion.rotation;
        let imu_offset = device_from_fusion.translation.vector;
        let angular_velocity = rot_df * fs.angular_velocity;
        let linear_velocity = rot_df * lin_vel - angular_velocity.cross(&imu_offset);
        let linear_accel = rot_df * lin_accel;

        ViewPose {
            pose,
            linear_velocity,
            linear_accel,
            angular_velocity,
        }
    }
}

fn flush_pending(st: &mut DeviceState, device_id: u32) {
    if st.pending_imu.is_empty() {
        return;
    }
    let samples = std::mem::take(&mut st.pending_imu);
    st.telemetry.imu_batch(device_id, &samples);
    st.pending_imu = samples;
    st.pending_imu.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::{FilterState, PoseError, PoseFilter};
    use crate::types::ExposureDeviceInfo;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq, Clone)]
    enum FilterCall {
        Imu(u64),
        Position(usize),
        Pose(usize),
        Prepare(usize, u64),
        Release(usize),
    }

    #[derive(Default)]
    struct RecordingFilter {
        calls: Arc<Mutex<Vec<FilterCall>>>,
    }

    impl PoseFilter for RecordingFilter {
        fn init(&mut self, _initial_pose: &Isometry3<f64>, _num_delay_slots: usize) {}

        fn imu_update(
            &mut self,
            time_ns: u64,
            _dt: f64,
            _ang_vel: &Vector3<f64>,
            _accel: &Vector3<f64>,
            _mag: &Vector3<f64>,
        ) {
            self.calls.lock().unwrap().push(FilterCall::Imu(time_ns));
        }

        fn position_update(&mut self, slot_id: usize, _position: &Vector3<f64>) {
            self.calls.lock().unwrap().push(FilterCall::Position(slot_id));
        }

        fn pose_update(&mut self, slot_id: usize, _pose: &Isometry3<f64>) {
            self.calls.lock().unwrap().push(FilterCall::Pose(slot_id));
        }

        fn prepare_delay_slot(&mut self, slot_id: usize, time_ns: u64) {
            self.calls
                .lock()
                .unwrap()
                .push(FilterCall::Prepare(slot_id, time_ns));
        }

        fn release_delay_slot(&mut self, slot_id: usize) {
            self.calls.lock().unwrap().push(FilterCall::Release(slot_id));
        }

        fn state_at(&mut self, _time_ns: u64) -> FilterState {
            FilterState::at_rest(Isometry3::translation(1.0, 2.0, 3.0))
        }

        fn predicted_pose(&mut self, _time_ns: u64) -> (Isometry3<f64>, PoseError) {
            (
                Isometry3::identity(),
                PoseError {
                    pos: Vector3::zeros(),
                    rot: Vector3::zeros(),
                },
            )
        }
    }

    struct CountingTelemetry {
        batches: Arc<AtomicUsize>,
        samples: Arc<AtomicUsize>,
    }

    impl TelemetrySink for CountingTelemetry {
        fn imu_batch(&mut self, _device_id: u32, samples: &[ImuSample]) {
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.samples.fetch_add(samples.len(), Ordering::Relaxed);
        }
    }

    fn identity_config(id: u32) -> DeviceConfig {
        DeviceConfig {
            id,
            device_from_fusion: Isometry3::identity(),
            device_from_model: Isometry3::identity(),
        }
    }

    fn device_with_filter() -> (TrackedDevice, Arc<Mutex<Vec<FilterCall>>>) {
        let filter = RecordingFilter::default();
        let calls = filter.calls.clone();
        let dev = TrackedDevice::new(
            identity_config(1),
            0,
            Box::new(filter),
            Box::new(NullTelemetry),
        );
        (dev, calls)
    }

    fn imu_step(dev: &TrackedDevice, raw_ts: u32) {
        dev.imu_update(
            0,
            raw_ts,
            0.001,
            &Vector3::zeros(),
            &Vector3::new(0.0, 9.81, 0.0),
            &Vector3::zeros(),
        );
    }

    fn exposure_for(dev: &TrackedDevice, count: u16) -> ExposureInfo {
        let mut info = ExposureDeviceInfo::new(dev.id());
        dev.on_exposure(&mut info);
        ExposureInfo {
            local_ts: 0,
            hmd_ts: 0,
            count,
            led_pattern_phase: 0,
            devices: vec![info],
        }
    }

    #[test]
    fn test_device_clock_extension_survives_wrap() {
        let (dev, _calls) = device_with_filter();
        imu_step(&dev, 0xFFFF_FF00);
        let before = dev.device_time_ns();
        imu_step(&dev, 0x0000_0100);
        assert_eq!(dev.device_time_ns() - before, 0x200 * 1000);
    }

    #[test]
    fn test_device_time_is_nondecreasing() {
        let (dev, _calls) = device_with_filter();
        let mut prev = 0;
        for raw in [100u32, 1100, 1100, 2100, 50_000] {
            imu_step(&dev, raw);
            let t = dev.device_time_ns();
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn test_exposure_allocates_slot_and_prepares_filter() {
        let (dev, calls) = device_with_filter();
        imu_step(&dev, 1000);
        imu_step(&dev, 2000);
        let t = dev.device_time_ns();

        let exposure = exposure_for(&dev, 1);
        let info = &exposure.devices[0];
        assert_eq!(info.device_time_ns, t);
        assert!(info.fusion_slot >= 0);
        assert!(!info.had_pose_lock);
        assert!(calls
            .lock()
            .unwrap()
            .contains(&FilterCall::Prepare(info.fusion_slot as usize, t)));
    }

    #[test]
    fn test_pose_update_accepts_and_updates_filter() {
        let (dev, calls) = device_with_filter();
        imu_step(&dev, 1000);
        let exposure = exposure_for(&dev, 1);
        let slot = exposure.devices[0].fusion_slot as usize;

        dev.pose_update(
            0,
            &exposure,
            PoseMatch::POSITION | PoseMatch::ORIENT,
            &Isometry3::translation(0.1, 0.0, 0.0),
        );
        assert!(calls.lock().unwrap().contains(&FilterCall::Pose(slot)));
    }

    #[test]
    fn test_stale_weak_position_is_rejected_but_recorded() {
        let (dev, calls) = device_with_filter();
        imu_step(&dev, 0);

        // Establish pose lock and a first exposure E1.
        imu_step(&dev, 100_000); // t = 100 ms
        let e1 = exposure_for(&dev, 1);
        dev.pose_update(
            0,
            &e1,
            PoseMatch::POSITION | PoseMatch::ORIENT,
            &Isometry3::identity(),
        );

        // A later exposure E2 whose strong report lands first.
        imu_step(&dev, 200_000); // t = 200 ms
        let e2 = exposure_for(&dev, 2);
        dev.pose_update(
            0,
            &e2,
            PoseMatch::POSITION | PoseMatch::ORIENT,
            &Isometry3::identity(),
        );

        // E1 gets a second, weak report from another sensor: stale.
        let n_filter_calls = calls.lock().unwrap().len();
        dev.pose_update(0, &e1, PoseMatch::GOOD, &Isometry3::identity());
        assert_eq!(calls.lock().unwrap().len(), n_filter_calls);
    }

    #[test]
    fn test_weak_position_accepted_without_pose_lock() {
        let (dev, calls) = device_with_filter();
        imu_step(&dev, 0);
        imu_step(&dev, 1_000_000); // 1 s without observations: no pose lock

        let e1 = exposure_for(&dev, 1);
        assert!(!e1.devices[0].had_pose_lock);
        dev.pose_update(0, &e1, PoseMatch::GOOD, &Isometry3::identity());
        // Weak score, but without prior lock the position still lands, and
        // the stale orientation forces a full pose update.
        let slot = e1.devices[0].fusion_slot as usize;
        assert!(calls.lock().unwrap().contains(&FilterCall::Pose(slot)));
    }

    #[test]
    fn test_orientation_refresh_fires_at_threshold() {
        let (dev, calls) = device_with_filter();
        imu_step(&dev, 0);
        imu_step(&dev, 10_000); // t = 10 ms
        let e1 = exposure_for(&dev, 1);
        dev.pose_update(
            0,
            &e1,
            PoseMatch::POSITION | PoseMatch::ORIENT,
            &Isometry3::identity(),
        );

        // 99 ms later: no orientation match, orientation withheld.
        imu_step(&dev, 109_000);
        let e2 = exposure_for(&dev, 2);
        let s2 = e2.devices[0].fusion_slot as usize;
        dev.pose_update(0, &e2, PoseMatch::POSITION, &Isometry3::identity());
        assert!(calls.lock().unwrap().contains(&FilterCall::Position(s2)));

        // Exactly 100 ms since the last orientation match: forced refresh.
        imu_step(&dev, 110_000);
        let e3 = exposure_for(&dev, 3);
        let s3 = e3.devices[0].fusion_slot as usize;
        dev.pose_update(0, &e3, PoseMatch::POSITION, &Isometry3::identity());
        assert!(calls.lock().unwrap().contains(&FilterCall::Pose(s3)));
    }

    #[test]
    fn test_position_freezes_at_loss_threshold() {
        let (dev, _calls) = device_with_filter();
        imu_step(&dev, 0);
        imu_step(&dev, 1000);
        let e1 = exposure_for(&dev, 1);
        dev.pose_update(
            0,
            &e1,
            PoseMatch::POSITION | PoseMatch::ORIENT,
            &Isometry3::identity(),
        );
        let live = dev.get_view_pose();
        assert_relative_eq!(
            live.pose.translation.vector,
            Vector3::new(1.0, 2.0, 3.0),
            epsilon = 1e-9
        );

        // Exactly 500 ms after the observation: frozen at the last
        // reported position, velocities clamped.
        imu_step(&dev, 501_000);
        let lost = dev.get_view_pose();
        assert_relative_eq!(
            lost.pose.translation.vector,
            live.pose.translation.vector,
            epsilon = 1e-9
        );
        assert_eq!(lost.linear_velocity, Vector3::zeros());
        assert_eq!(lost.linear_accel, Vector3::zeros());
    }

    #[test]
    fn test_view_pose_filtered_once_per_device_time() {
        let (dev, _calls) = device_with_filter();
        imu_step(&dev, 0);
        imu_step(&dev, 1000);
        let a = dev.get_view_pose();
        let b = dev.get_view_pose();
        assert_relative_eq!(a.pose, b.pose, epsilon = 1e-12);
    }

    #[test]
    fn test_slot_release_edge_informs_filter() {
        let (dev, calls) = device_with_filter();
        imu_step(&dev, 1000);
        let exposure = exposure_for(&dev, 1);
        let info = &exposure.devices[0];
        let slot = info.fusion_slot as usize;

        dev.claim_slot(info);
        dev.claim_slot(info);
        dev.release_slot(info);
        assert!(!calls.lock().unwrap().contains(&FilterCall::Release(slot)));
        dev.release_slot(info);
        assert!(calls.lock().unwrap().contains(&FilterCall::Release(slot)));
        // Further releases are no-ops.
        dev.release_slot(info);
        let n = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == FilterCall::Release(slot))
            .count();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_pending_imu_flushes_on_exposure_and_overflow() {
        let batches = Arc::new(AtomicUsize::new(0));
        let samples = Arc::new(AtomicUsize::new(0));
        let telemetry = CountingTelemetry {
            batches: batches.clone(),
            samples: samples.clone(),
        };
        let dev = TrackedDevice::new(
            identity_config(1),
            0,
            Box::new(RecordingFilter::default()),
            Box::new(telemetry),
        );

        for i in 0..10 {
            imu_step(&dev, i * 1000);
        }
        let _ = exposure_for(&dev, 1);
        assert_eq!(batches.load(Ordering::Relaxed), 1);
        assert_eq!(samples.load(Ordering::Relaxed), 10);

        for i in 0..PENDING_IMU_CAPACITY as u32 + 1 {
            imu_step(&dev, 20_000 + i * 1000);
        }
        assert_eq!(batches.load(Ordering::Relaxed), 2);
        assert_eq!(
            samples.load(Ordering::Relaxed),
            10 + PENDING_IMU_CAPACITY
        );
    }
}
