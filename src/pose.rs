use nalgebra::{Isometry3, Translation3, Vector3};

/// The rigid-transform calibration of one tracked device.
///
/// `device_from_fusion` maps IMU-frame coordinates to the device body frame,
/// `fusion_from_model` maps LED-constellation-model coordinates to the IMU
/// frame, and `model_from_fusion` is its cached inverse. Together they
/// satisfy `device_from_model = device_from_fusion * fusion_from_model`.
#[derive(Debug, Clone, Copy)]
pub struct DeviceTransforms {
    pub device_from_fusion: Isometry3<f64>,
    pub fusion_from_model: Isometry3<f64>,
    pub model_from_fusion: Isometry3<f64>,
}

impl DeviceTransforms {
    pub fn new(device_from_fusion: Isometry3<f64>, device_from_model: Isometry3<f64>) -> Self {
        let fusion_from_model = device_from_fusion.inverse() * device_from_model;
        Self {
            device_from_fusion,
            fusion_from_model,
            model_from_fusion: fusion_from_model.inverse(),
        }
    }
}

/// User-visible pose of a device body in world coordinates, with
/// body-frame derivatives.
#[derive(Debug, Clone, Copy)]
pub struct ViewPose {
    pub pose: Isometry3<f64>,
    pub linear_velocity: Vector3<f64>,
    pub linear_accel: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

const POS_ALPHA: f64 = 0.4;
const ROT_ALPHA: f64 = 0.6;

/// Exponential moving filter over a pose: position is lerped, orientation
/// slerped toward each new target. The first target passes through.
#[derive(Debug, Default)]
pub struct ExpFilterPose {
    state: Option<Isometry3<f64>>,
}

impl ExpFilterPose {
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn filter(&mut self, target: &Isometry3<f64>) -> Isometry3<f64> {
        let next = match self.state {
            None => *target,
            Some(prev) => {
                let pos = prev
                    .translation
                    .vector
                    .lerp(&target.translation.vector, POS_ALPHA);
                let rot = prev.rotation.slerp(&target.rotation, ROT_ALPHA);
                Isometry3::from_parts(Translation3::from(pos), rot)
            }
        };
        self.state = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use std::f64::consts::FRAC_PI_2;

    fn sample_transforms() -> DeviceTransforms {
        let device_from_fusion = Isometry3::from_parts(
            Translation3::new(0.01, -0.02, 0.05),
            UnitQuaternion::from_euler_angles(0.0, FRAC_PI_2, 0.0),
        );
        let device_from_model = Isometry3::from_parts(
            Translation3::new(-0.03, 0.0, 0.015),
            UnitQuaternion::from_euler_angles(0.1, 0.0, -0.2),
        );
        DeviceTransforms::new(device_from_fusion, device_from_model)
    }

    #[test]
    fn test_transforms_compose_to_device_from_model() {
        let device_from_fusion = Isometry3::from_parts(
            Translation3::new(0.01, -0.02, 0.05),
            UnitQuaternion::from_euler_angles(0.0, FRAC_PI_2, 0.0),
        );
        let device_from_model = Isometry3::from_parts(
            Translation3::new(-0.03, 0.0, 0.015),
            UnitQuaternion::from_euler_angles(0.1, 0.0, -0.2),
        );
        let t = DeviceTransforms::new(device_from_fusion, device_from_model);
        let recomposed = t.device_from_fusion * t.fusion_from_model;
        assert_relative_eq!(recomposed, device_from_model, epsilon = 1e-12);
    }

    #[test]
    fn test_model_fusion_transforms_are_mutual_inverses() {
        let t = sample_transforms();
        let id = t.fusion_from_model * t.model_from_fusion;
        assert_relative_eq!(id, Isometry3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_filter_first_sample_passes_through() {
        let mut f = ExpFilterPose::new();
        let target = Isometry3::from_parts(
            Translation3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_euler_angles(0.3, 0.0, 0.0),
        );
        assert_relative_eq!(f.filter(&target), target, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_filter_converges_toward_target() {
        let mut f = ExpFilterPose::new();
        f.filter(&Isometry3::identity());
        let target = Isometry3::from_parts(
            Translation3::new(1.0, 0.0, 0.0),
            UnitQuaternion::identity(),
        );
        let mut dist = 1.0;
        for _ in 0..20 {
            let out = f.filter(&target);
            let next = (out.translation.vector - target.translation.vector).norm();
            assert!(next < dist);
            dist = next;
        }
        assert!(dist < 1e-3);
    }
}
