//! # constellation - Rift optical + inertial positional tracking core
//!
//! Fuses IMU reports from a Rift headset and its controllers with pose
//! observations recovered from constellation-sensor video. Provides:
//! - UVC stream negotiation and isochronous frame assembly for the DK2 and
//!   CV1 sensors
//! - Per-device delay slots that let late visual observations correct the
//!   pose filter retroactively at the exposure instant
//! - Device-clock extension and smoothed, gated view-pose output
//!
//! The 6-DoF filter itself and the vision pipeline are external; the crate
//! talks to them through [`fusion::PoseFilter`] and pose reports.
//!
//! ## Quick Start
//! ```no_run
//! use constellation::{stream, Tracker};
//!
//! let tracker = Tracker::new().unwrap();
//! let (frame_cb, frames) = stream::frame_channel(8);
//! let mut video = tracker.start_video_stream(4, frame_cb).unwrap();
//! let frame = frames.recv().unwrap();
//! println!("frame: {} bytes pts {}", frame.data_size(), frame.pts);
//! video.stop();
//! ```

pub mod device;
pub mod error;
pub mod fusion;
pub mod pool;
pub mod pose;
pub mod slots;
pub mod stream;
pub mod tracker;
pub mod types;
pub mod uvc;

pub use device::{DeviceConfig, TrackedDevice};
pub use error::TrackerError;
pub use pose::ViewPose;
pub use tracker::Tracker;
pub use types::*;

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
