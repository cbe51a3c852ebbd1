use std::time::Duration;

use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType};

use crate::{Result, TrackerError};

// -- USB identifiers --
pub const SENSOR_VID: u16 = 0x2833;
pub const DK2_SENSOR_PID: u16 = 0x0201;
pub const CV1_SENSOR_PID: u16 = 0x0211;

/// Interface 0 is control, interface 1 carries the video stream.
pub const VS_INTERFACE: u8 = 1;
/// Isochronous IN endpoint of the video stream.
pub const VIDEO_ENDPOINT: u8 = 0x81;

// -- Class-specific video streaming requests --
const SET_CUR: u8 = 0x01;
const GET_CUR: u8 = 0x81;
const VS_PROBE_CONTROL: u16 = 1;
const VS_COMMIT_CONTROL: u16 = 2;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// UVC payload header length. Anything shorter than this, or a payload that
/// is nothing but this header, carries no image data.
pub const PAYLOAD_HEADER_SIZE: usize = 12;

bitflags::bitflags! {
    /// bmHeaderInfo bits of the UVC payload header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderInfo: u8 {
        const FRAME_ID     = 1 << 0;
        const END_OF_FRAME = 1 << 1;
        const PTS          = 1 << 2;
        const SCR          = 1 << 3;
        const ERROR        = 1 << 6;
    }
}

/// Parsed 12-byte UVC payload header.
#[derive(Debug, Clone, Copy)]
pub struct PayloadHeader {
    pub info: HeaderInfo,
    pub pts: u32,
    pub sof_counter: u16,
    pub scr: u32,
}

/// Parse the payload header, little-endian on the wire:
/// `{ bHeaderLength, bmHeaderInfo, dwPresentationTime, wSofCounter,
/// scrSourceClock }`. Returns `None` when the payload is too short or
/// claims a header length other than 12.
pub fn parse_payload_header(payload: &[u8]) -> Option<PayloadHeader> {
    if payload.len() < PAYLOAD_HEADER_SIZE || payload[0] as usize != PAYLOAD_HEADER_SIZE {
        return None;
    }
    Some(PayloadHeader {
        info: HeaderInfo::from_bits_truncate(payload[1]),
        pts: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
        sof_counter: u16::from_le_bytes([payload[6], payload[7]]),
        scr: u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
    })
}

/// UVC probe/commit control block. The wire form is the 26-byte UVC 1.0
/// layout ending at dwMaxPayloadTransferSize; clock frequency and framing
/// info are host-side state for the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCommit {
    pub bm_hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: u32,
    pub framing_info: u8,
}

pub const PROBE_COMMIT_SIZE: usize = 26;

impl ProbeCommit {
    pub fn to_bytes(&self) -> [u8; PROBE_COMMIT_SIZE] {
        let mut buf = [0u8; PROBE_COMMIT_SIZE];
        buf[0..2].copy_from_slice(&self.bm_hint.to_le_bytes());
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        buf[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        buf[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        buf[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        buf[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        buf[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        buf[16..18].copy_from_slice(&self.delay.to_le_bytes());
        buf[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        buf[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROBE_COMMIT_SIZE {
            return None;
        }
        Some(Self {
            bm_hint: u16::from_le_bytes([buf[0], buf[1]]),
            format_index: buf[2],
            frame_index: buf[3],
            frame_interval: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            key_frame_rate: u16::from_le_bytes([buf[8], buf[9]]),
            p_frame_rate: u16::from_le_bytes([buf[10], buf[11]]),
            comp_quality: u16::from_le_bytes([buf[12], buf[13]]),
            comp_window_size: u16::from_le_bytes([buf[14], buf[15]]),
            delay: u16::from_le_bytes([buf[16], buf[17]]),
            max_video_frame_size: u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]),
            max_payload_transfer_size: u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]),
            clock_frequency: 0,
            framing_info: 0,
        })
    }
}

/// The two supported constellation sensor generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorVariant {
    Dk2,
    Cv1,
}

/// Stream parameters for one sensor generation.
#[derive(Debug, Clone)]
pub struct SensorProfile {
    pub variant: SensorVariant,
    pub pid: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub width: usize,
    pub height: usize,
    pub frame_size: usize,
    pub payload_transfer_size: u32,
    /// Camera PTS clock, when the firmware departs from the UVC default.
    pub clock_frequency: Option<u32>,
    pub packet_size: usize,
    pub alt_setting: u8,
    /// Device default; the transfer layout recomputes the per-transfer
    /// packet count from frame and packet sizes at stream start.
    pub num_packets: usize,
}

static DK2_PROFILE: SensorProfile = SensorProfile {
    variant: SensorVariant::Dk2,
    pid: DK2_SENSOR_PID,
    format_index: 1,
    frame_index: 1,
    frame_interval: 166_666,
    width: 752,
    height: 480,
    frame_size: 360_960,
    payload_transfer_size: 3_000,
    clock_frequency: None,
    packet_size: 3_060,
    alt_setting: 7,
    num_packets: 32,
};

static CV1_PROFILE: SensorProfile = SensorProfile {
    variant: SensorVariant::Cv1,
    pid: CV1_SENSOR_PID,
    format_index: 1,
    frame_index: 4,
    frame_interval: 192_000,
    width: 1280,
    height: 960,
    frame_size: 1_228_800,
    payload_transfer_size: 3_072,
    clock_frequency: Some(40_000_000),
    packet_size: 16_384,
    alt_setting: 2,
    num_packets: 0,
};

impl SensorVariant {
    pub fn from_pid(pid: u16) -> Option<Self> {
        match pid {
            DK2_SENSOR_PID => Some(Self::Dk2),
            CV1_SENSOR_PID => Some(Self::Cv1),
            _ => None,
        }
    }

    pub fn profile(self) -> &'static SensorProfile {
        match self {
            Self::Dk2 => &DK2_PROFILE,
            Self::Cv1 => &CV1_PROFILE,
        }
    }
}

fn set_cur(handle: &DeviceHandle<Context>, selector: u16, data: &[u8]) -> Result<()> {
    let rt = rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
    handle.write_control(
        rt,
        SET_CUR,
        selector << 8,
        VS_INTERFACE as u16,
        data,
        CONTROL_TIMEOUT,
    )?;
    Ok(())
}

fn get_cur(handle: &DeviceHandle<Context>, selector: u16, buf: &mut [u8]) -> Result<usize> {
    let rt = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);
    let n = handle.read_control(
        rt,
        GET_CUR,
        selector << 8,
        VS_INTERFACE as u16,
        buf,
        CONTROL_TIMEOUT,
    )?;
    Ok(n)
}

/// Run the probe/commit negotiation for the given profile and return the
/// committed parameters. Fails when the device settles on a frame size
/// other than the profile's.
pub fn negotiate(handle: &DeviceHandle<Context>, profile: &SensorProfile) -> Result<ProbeCommit> {
    let request = ProbeCommit {
        bm_hint: 1,
        format_index: profile.format_index,
        frame_index: profile.frame_index,
        frame_interval: profile.frame_interval,
        max_video_frame_size: profile.frame_size as u32,
        max_payload_transfer_size: profile.payload_transfer_size,
        ..ProbeCommit::default()
    };

    set_cur(handle, VS_PROBE_CONTROL, &request.to_bytes())?;

    let mut buf = [0u8; PROBE_COMMIT_SIZE];
    let n = get_cur(handle, VS_PROBE_CONTROL, &mut buf)?;
    let mut committed = ProbeCommit::from_bytes(&buf[..n])
        .ok_or_else(|| TrackerError::Negotiation(format!("short probe response ({} bytes)", n)))?;
    committed.clock_frequency = profile.clock_frequency.unwrap_or(0);

    if committed.max_video_frame_size as usize != profile.frame_size {
        return Err(TrackerError::Negotiation(format!(
            "device offered frame size {}, profile requires {}",
            committed.max_video_frame_size, profile.frame_size
        )));
    }

    set_cur(handle, VS_COMMIT_CONTROL, &committed.to_bytes())?;

    log::info!(
        "UVC stream committed: {}x{} frame_size={} payload={} interval={}",
        profile.width,
        profile.height,
        committed.max_video_frame_size,
        committed.max_payload_transfer_size,
        committed.frame_interval
    );

    Ok(committed)
}

/// Vendor initialization the DK2's ESP570 bridge wants before streaming.
/// The two reads have no documented meaning; the responses are discarded.
pub fn esp570_setup_unknown_3(handle: &DeviceHandle<Context>) -> Result<()> {
    let rt = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
    let mut buf = [0u8; 2];
    handle.read_control(rt, 0x02, 0xf0, 0, &mut buf, CONTROL_TIMEOUT)?;
    handle.read_control(rt, 0x02, 0xf1, 0, &mut buf, CONTROL_TIMEOUT)?;
    Ok(())
}
