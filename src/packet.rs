/*!
    wire frame codec

    `[START][SENDER][RECEIVER][KIND][LEN][PAYLOAD...][CRC?]`, stateless per
    call. anything malformed decodes to `None` and is the caller's cue to
    stay silent: a frame that fails its checksum cannot be trusted to name
    its real origin, so no error response goes out.
*/

use packbytes::{ByteArray, FromBytes, ToBytes};
use log::*;

use crate::config::MAX_FRAME;
use crate::profile::{PacketKind, Profile};


/// fixed part of every frame
#[derive(Copy, Clone, Debug, Default, FromBytes, ToBytes)]
pub struct Header {
    pub start: u8,
    pub sender: u8,
    pub receiver: u8,
    pub kind: u8,
    pub length: u8,
}

pub const HEADER: usize = <Header as FromBytes>::Bytes::SIZE;
/// payload room left by header and checksum
pub const MAX_PAYLOAD: usize = MAX_FRAME - HEADER - 1;

/// a decoded frame, payload borrowed from the receive buffer
#[derive(Debug)]
pub struct Frame<'a> {
    pub sender: u8,
    pub receiver: u8,
    pub kind: PacketKind,
    pub payload: &'a [u8],
}

/// CRC-8, polynomial 0x97, init 0, over header and payload
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in bytes {
        crc ^= byte;
        for _ in 0 .. 8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x97 } else { crc << 1 };
        }
    }
    crc
}

/// serialize a frame into `out`, returning the wire length
///
/// `None` when the payload does not fit, which is a caller bug kept
/// non-fatal: the frame is simply not sent
pub fn encode(
    profile: &Profile,
    sender: u8,
    receiver: u8,
    kind: PacketKind,
    payload: &[u8],
    out: &mut [u8],
) -> Option<usize> {
    let total = HEADER + payload.len() + usize::from(profile.crc);
    if payload.len() > u8::MAX as usize || total > out.len() {
        warn!("payload of {:?} does not fit a frame", kind);
        return None;
    }
    let header = Header {
        start: profile.start,
        sender,
        receiver,
        kind: profile.byte(kind),
        length: payload.len() as u8,
    };
    out[.. HEADER].copy_from_slice(&header.to_be_bytes());
    out[HEADER ..][.. payload.len()].copy_from_slice(payload);
    if profile.crc {
        out[HEADER + payload.len()] = crc8(&out[.. HEADER + payload.len()]);
    }
    Some(total)
}

/// parse and validate one received frame
pub fn decode<'a>(profile: &Profile, raw: &'a [u8]) -> Option<Frame<'a>> {
    if raw.len() < HEADER {
        debug!("frame shorter than a header, dropped");
        return None;
    }
    let header = Header::from_be_bytes(raw[.. HEADER].try_into().ok()?);
    if header.start != profile.start {
        debug!("bad start marker {:#04x}, dropped", header.start);
        return None;
    }
    let length = usize::from(header.length);
    let total = HEADER + length + usize::from(profile.crc);
    if raw.len() != total {
        debug!("length field disagrees with frame size, dropped");
        return None;
    }
    if profile.crc && crc8(&raw[.. HEADER + length]) != raw[total - 1] {
        debug!("checksum mismatch, dropped");
        return None;
    }
    let Some(kind) = profile.kind(header.kind) else {
        debug!("unknown packet kind {:#04x}, dropped", header.kind);
        return None;
    };
    Some(Frame {
        sender: header.sender,
        receiver: header.receiver,
        kind,
        payload: &raw[HEADER .. HEADER + length],
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let profile = Profile::v1();
        let mut wire = [0; MAX_FRAME];
        let len = encode(&profile, 255, 254, PacketKind::AddressRequest, b"sn-01", &mut wire)
            .unwrap();
        assert_eq!(len, HEADER + 5 + 1);

        let frame = decode(&profile, &wire[.. len]).unwrap();
        assert_eq!(frame.sender, 255);
        assert_eq!(frame.receiver, 254);
        assert_eq!(frame.kind, PacketKind::AddressRequest);
        assert_eq!(frame.payload, b"sn-01");
    }

    #[test]
    fn corrupted_crc_is_dropped() {
        let profile = Profile::v1();
        let mut wire = [0; MAX_FRAME];
        let len = encode(&profile, 7, 254, PacketKind::Pong, &[1], &mut wire).unwrap();
        wire[HEADER] ^= 0x40;
        assert!(decode(&profile, &wire[.. len]).is_none());
    }

    #[test]
    fn truncated_frame_is_dropped() {
        let profile = Profile::v1();
        let mut wire = [0; MAX_FRAME];
        let len = encode(&profile, 7, 254, PacketKind::Pong, &[1, 2, 3], &mut wire).unwrap();
        assert!(decode(&profile, &wire[.. len - 2]).is_none());
    }

    #[test]
    fn foreign_revision_is_dropped() {
        // a legacy frame must not decode under the v1 profile
        let legacy = Profile::legacy();
        let mut wire = [0; MAX_FRAME];
        let len = encode(&legacy, 3, 254, PacketKind::Ping, &[], &mut wire).unwrap();
        assert!(decode(&Profile::v1(), &wire[.. len]).is_none());
        assert!(decode(&legacy, &wire[.. len]).is_some());
    }

    #[test]
    fn crc_disabled_profile() {
        let mut profile = Profile::v1();
        profile.crc = false;
        let mut wire = [0; MAX_FRAME];
        let len = encode(&profile, 7, 254, PacketKind::Pong, &[9], &mut wire).unwrap();
        assert_eq!(len, HEADER + 1);
        let frame = decode(&profile, &wire[.. len]).unwrap();
        assert_eq!(frame.payload, &[9]);
    }
}
