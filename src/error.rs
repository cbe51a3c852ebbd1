/// Errors that can occur while setting up or driving the tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("no supported sensor found (VID=2833)")]
    SensorNotFound,

    #[error("unsupported sensor PID={0:04x}")]
    UnsupportedSensor(u16),

    #[error("UVC negotiation failed: {0}")]
    Negotiation(String),

    #[error("video stream setup failed: {0}")]
    StreamSetup(String),

    #[error("video stream stopped")]
    StreamStopped,

    #[error("timeout waiting for data")]
    Timeout,

    #[error("unknown tracked device {0}")]
    UnknownDevice(u32),
}
