//! Hydraulic Rig Protocol
//!
//! Byte-exact frames exchanged with the rig controller:
//!
//! ```text
//! Upload   host -> rig : F7 v1 v2 v3 v4          (no reply)
//! Download host -> rig : F5
//!          rig -> host : F5 v1 v2 v3 v4
//!
//! vi = 180 - angle_i, angle_i in 0..=180
//! ```
//!
//! Every call performs one complete frame on the channel. Callers are
//! responsible for never running two frames at once.

use crate::domain::error::LinkError;
use crate::domain::models::{ActuatorAngles, ACTUATOR_COUNT, MAX_ANGLE};
use crate::infrastructure::bluetooth::channel::ByteChannel;
use std::time::Duration;
use tracing::{debug, trace};

/// Serial Port Profile service class UUID.
pub const SERVICE_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// Leading byte of an upload frame.
pub const UPLOAD_CODE: u8 = 0xF7;

/// Leading byte of a download request, echoed by the rig in its reply.
pub const DOWNLOAD_CODE: u8 = 0xF5;

/// Actuator travel time after an upload.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Wire value for an angle.
pub fn encode_angle(angle: u8) -> u8 {
    MAX_ANGLE - angle.min(MAX_ANGLE)
}

/// Angle for a wire value; bytes above 180 are rejected.
pub fn decode_angle(byte: u8) -> Result<u8, LinkError> {
    if byte > MAX_ANGLE {
        return Err(LinkError::InvalidPosition(byte));
    }
    Ok(MAX_ANGLE - byte)
}

pub fn upload_frame(angles: &ActuatorAngles) -> [u8; 1 + ACTUATOR_COUNT] {
    let mut frame = [UPLOAD_CODE; 1 + ACTUATOR_COUNT];
    for (slot, angle) in frame[1..].iter_mut().zip(angles.as_array()) {
        *slot = encode_angle(angle);
    }
    frame
}

/// Decode the four position bytes of a download reply.
pub fn parse_positions(bytes: &[u8; ACTUATOR_COUNT]) -> Result<ActuatorAngles, LinkError> {
    let mut angles = [0u8; ACTUATOR_COUNT];
    for (slot, &byte) in angles.iter_mut().zip(bytes) {
        *slot = decode_angle(byte)?;
    }
    ActuatorAngles::new(angles)
}

/// Write an upload frame, then wait `settle` for the actuators to travel.
pub fn upload(
    channel: &mut dyn ByteChannel,
    angles: &ActuatorAngles,
    settle: Duration,
) -> Result<(), LinkError> {
    let frame = upload_frame(angles);
    channel.write_all(&frame)?;

    debug!("MOTORS {}", angles);
    trace!("Upload frame: {:02X?}", frame);

    std::thread::sleep(settle);
    Ok(())
}

/// Request and read the current positions.
pub fn download(channel: &mut dyn ByteChannel) -> Result<ActuatorAngles, LinkError> {
    channel.write_all(&[DOWNLOAD_CODE])?;

    let mut code = [0u8; 1];
    channel.read_exact(&mut code)?;
    if code[0] != DOWNLOAD_CODE {
        return Err(LinkError::ProtocolMismatch {
            expected: DOWNLOAD_CODE,
            actual: code[0],
        });
    }

    let mut payload = [0u8; ACTUATOR_COUNT];
    channel.read_exact(&mut payload)?;
    trace!("Download payload: {:02X?}", payload);

    let angles = parse_positions(&payload)?;
    debug!("Downloaded {}", angles);
    Ok(angles)
}

/// Parse a UUID string into its 128-bit value.
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<u128> {
    let hex = uuid_str.replace('-', "");

    if hex.len() != 32 {
        anyhow::bail!("invalid service UUID: {}", uuid_str);
    }

    u128::from_str_radix(&hex, 16)
        .map_err(|e| anyhow::anyhow!("invalid service UUID {}: {}", uuid_str, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::testing::{EchoChannel, ScriptedChannel};

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(uuid >> 96, 0x0000_1101);
        assert!(parse_uuid("00001101-0000").is_err());
        assert!(parse_uuid("zz001101-0000-1000-8000-00805F9B34FB").is_err());
    }

    #[test]
    fn test_angle_codec_is_inverse_over_domain() {
        for angle in 0..=MAX_ANGLE {
            assert_eq!(decode_angle(encode_angle(angle)).unwrap(), angle);
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        assert_eq!(decode_angle(181), Err(LinkError::InvalidPosition(181)));
        assert_eq!(decode_angle(255), Err(LinkError::InvalidPosition(255)));
    }

    #[test]
    fn test_upload_frame_bytes() {
        let angles = ActuatorAngles::new([0, 45, 90, 180]).unwrap();
        assert_eq!(upload_frame(&angles), [0xF7, 180, 135, 90, 0]);
    }

    #[test]
    fn test_upload_writes_one_frame_and_reads_nothing() {
        let mut channel = ScriptedChannel::new(&[]);
        let angles = ActuatorAngles::new([10, 20, 30, 40]).unwrap();
        upload(&mut channel, &angles, Duration::ZERO).unwrap();
        assert_eq!(channel.written(), vec![0xF7, 170, 160, 150, 140]);
        assert_eq!(channel.reads(), 0);
    }

    #[test]
    fn test_download_decodes_reply() {
        let mut channel = ScriptedChannel::new(&[0xF5, 180, 90, 0, 100]);
        let angles = download(&mut channel).unwrap();
        assert_eq!(angles.as_array(), [0, 90, 180, 80]);
        assert_eq!(channel.written(), vec![0xF5]);
    }

    #[test]
    fn test_download_wrong_reply_code() {
        let mut channel = ScriptedChannel::new(&[0x00, 180, 90, 0, 100]);
        let err = download(&mut channel).unwrap_err();
        assert_eq!(
            err,
            LinkError::ProtocolMismatch {
                expected: 0xF5,
                actual: 0x00
            }
        );
        // Nothing past the reply code was consumed.
        assert_eq!(channel.remaining(), 4);
    }

    #[test]
    fn test_download_out_of_range_byte() {
        let mut channel = ScriptedChannel::new(&[0xF5, 10, 200, 10, 10]);
        assert_eq!(
            download(&mut channel),
            Err(LinkError::InvalidPosition(200))
        );
    }

    #[test]
    fn test_download_short_reply_is_io_failure() {
        let mut channel = ScriptedChannel::new(&[0xF5, 10, 20]);
        assert!(matches!(
            download(&mut channel),
            Err(LinkError::IoFailure(_))
        ));
    }

    #[test]
    fn test_write_failure_is_io_failure() {
        let mut channel = ScriptedChannel::new(&[]).fail_writes_after(0);
        let angles = ActuatorAngles::new([1, 2, 3, 4]).unwrap();
        assert!(matches!(
            upload(&mut channel, &angles, Duration::ZERO),
            Err(LinkError::IoFailure(_))
        ));
    }

    #[test]
    fn test_upload_then_download_round_trip() {
        let mut channel = EchoChannel::default();
        let angles = ActuatorAngles::new([0, 33, 127, 180]).unwrap();
        upload(&mut channel, &angles, Duration::ZERO).unwrap();
        assert_eq!(download(&mut channel).unwrap(), angles);
    }
}
