//! Feed a tracker synthetic IMU and exposure input and print view poses.
//!
//! Usage: cargo run --example track
//!
//! No hardware is required; a trivial stand-in filter integrates nothing
//! and the exposure cadence is simulated at 54 Hz.

use std::time::Duration;

use constellation::device::NullTelemetry;
use constellation::fusion::{FilterState, PoseError, PoseFilter};
use constellation::types::monotonic_ns;
use constellation::{DeviceConfig, Tracker};
use nalgebra::{Isometry3, Vector3};

/// Holds whatever pose it was last told; enough to exercise the plumbing.
struct PassthroughFilter {
    pose: Isometry3<f64>,
}

impl PoseFilter for PassthroughFilter {
    fn init(&mut self, initial_pose: &Isometry3<f64>, _num_delay_slots: usize) {
        self.pose = *initial_pose;
    }

    fn imu_update(
        &mut self,
        _time_ns: u64,
        _dt: f64,
        _ang_vel: &Vector3<f64>,
        _accel: &Vector3<f64>,
        _mag: &Vector3<f64>,
    ) {
    }

    fn position_update(&mut self, _slot_id: usize, position: &Vector3<f64>) {
        self.pose.translation.vector = *position;
    }

    fn pose_update(&mut self, _slot_id: usize, pose: &Isometry3<f64>) {
        self.pose = *pose;
    }

    fn prepare_delay_slot(&mut self, _slot_id: usize, _time_ns: u64) {}

    fn release_delay_slot(&mut self, _slot_id: usize) {}

    fn state_at(&mut self, _time_ns: u64) -> FilterState {
        FilterState::at_rest(self.pose)
    }

    fn predicted_pose(&mut self, _time_ns: u64) -> (Isometry3<f64>, PoseError) {
        (
            self.pose,
            PoseError {
                pos: Vector3::repeat(0.01),
                rot: Vector3::repeat(0.02),
            },
        )
    }
}

fn main() {
    env_logger::init();

    let tracker = match Tracker::new() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to create tracker: {}", e);
            std::process::exit(1);
        }
    };

    let hmd = tracker.add_device(
        DeviceConfig {
            id: 0,
            device_from_fusion: Isometry3::translation(0.0, 0.01, -0.03),
            device_from_model: Isometry3::identity(),
        },
        Box::new(PassthroughFilter {
            pose: Isometry3::identity(),
        }),
        Box::new(NullTelemetry),
    );

    println!("Simulating IMU at 1000 Hz, exposures at 54 Hz (Ctrl+C to stop)...");

    let mut raw_ts: u32 = 0;
    let mut exposure_count: u16 = 0;
    for tick in 0u64.. {
        raw_ts = raw_ts.wrapping_add(1000);
        hmd.imu_update(
            monotonic_ns(),
            raw_ts,
            0.001,
            &Vector3::new(0.0, 0.1, 0.0),
            &Vector3::new(0.0, 9.81, 0.0),
            &Vector3::zeros(),
        );

        // ~54 Hz exposure cadence against the 1 kHz IMU tick.
        if tick % 18 == 0 {
            exposure_count = exposure_count.wrapping_add(1);
            tracker.on_exposure(exposure_count, raw_ts, (exposure_count % 10) as u8);
        }

        if tick % 500 == 0 {
            let view = hmd.get_view_pose();
            let p = view.pose.translation.vector;
            println!(
                "t={:<12} pos=[{:+.4}, {:+.4}, {:+.4}] vel=[{:+.3}, {:+.3}, {:+.3}]",
                hmd.device_time_ns(),
                p.x,
                p.y,
                p.z,
                view.linear_velocity.x,
                view.linear_velocity.y,
                view.linear_velocity.z,
            );
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
