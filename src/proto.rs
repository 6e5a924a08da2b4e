//! The netevent 2 wire protocol: fixed-size frames, big-endian fields.
//!
//! Every frame is [`PACKET_SIZE`] bytes; the first two bytes hold the
//! command, the rest are command-specific. Only `AddDevice` is followed by
//! a variable-length payload (see [`crate::device`] for the encoder and
//! [`crate::uinput`] for the decoder).

use crate::error::{Error, Result};
use crate::event::{InputEvent, WIRE_EVENT_SIZE};
use crate::read_exact_fd;
use std::os::fd::RawFd;

/// The outer frame size: command, device id and an embedded wire event,
/// the largest frame variant. Shorter frames are zero-padded to this.
pub const PACKET_SIZE: usize = 4 + WIRE_EVENT_SIZE;

pub const HELLO_MAGIC: [u8; 8] = *b"NE2Hello";
pub const PROTOCOL_VERSION: u16 = 2;

pub const CMD_KEEPALIVE: u16 = 0;
pub const CMD_ADD_DEVICE: u16 = 1;
pub const CMD_REMOVE_DEVICE: u16 = 2;
pub const CMD_DEVICE_EVENT: u16 = 3;
pub const CMD_HELLO: u16 = 4;

/// The fixed fields of an `AddDevice` frame. The sizes are validated
/// against the receiver's build before the payload is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddDeviceHeader {
    pub id: u16,
    pub dev_info_size: u16,
    pub dev_name_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    KeepAlive,
    Hello { version: u16, magic: [u8; 8] },
    AddDevice(AddDeviceHeader),
    RemoveDevice { id: u16 },
    DeviceEvent { id: u16, event: InputEvent },
}

fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}

impl Packet {
    pub fn decode(frame: &[u8; PACKET_SIZE]) -> Result<Packet> {
        let cmd = be16(frame, 0);
        Ok(match cmd {
            CMD_KEEPALIVE => Packet::KeepAlive,
            CMD_HELLO => Packet::Hello {
                version: be16(frame, 2),
                magic: frame[4..12].try_into().unwrap(),
            },
            CMD_ADD_DEVICE => Packet::AddDevice(AddDeviceHeader {
                id: be16(frame, 2),
                dev_info_size: be16(frame, 4),
                dev_name_size: be16(frame, 6),
            }),
            CMD_REMOVE_DEVICE => Packet::RemoveDevice { id: be16(frame, 2) },
            CMD_DEVICE_EVENT => Packet::DeviceEvent {
                id: be16(frame, 2),
                event: InputEvent::decode(&frame[4..4 + WIRE_EVENT_SIZE]),
            },
            other => {
                return Err(Error::protocol(format!("unknown packet type {other}")));
            }
        })
    }
}

fn frame_with_cmd(cmd: u16) -> [u8; PACKET_SIZE] {
    let mut frame = [0u8; PACKET_SIZE];
    frame[0..2].copy_from_slice(&cmd.to_be_bytes());
    frame
}

pub fn encode_keep_alive() -> [u8; PACKET_SIZE] {
    frame_with_cmd(CMD_KEEPALIVE)
}

pub fn encode_hello() -> [u8; PACKET_SIZE] {
    let mut frame = frame_with_cmd(CMD_HELLO);
    frame[2..4].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame[4..12].copy_from_slice(&HELLO_MAGIC);
    frame
}

pub fn encode_remove_device(id: u16) -> [u8; PACKET_SIZE] {
    let mut frame = frame_with_cmd(CMD_REMOVE_DEVICE);
    frame[2..4].copy_from_slice(&id.to_be_bytes());
    frame
}

pub fn encode_device_event(id: u16, event: &InputEvent) -> [u8; PACKET_SIZE] {
    let mut frame = frame_with_cmd(CMD_DEVICE_EVENT);
    frame[2..4].copy_from_slice(&id.to_be_bytes());
    event.encode(&mut frame[4..4 + WIRE_EVENT_SIZE]);
    frame
}

pub fn encode_add_device_header(hdr: &AddDeviceHeader) -> [u8; PACKET_SIZE] {
    let mut frame = frame_with_cmd(CMD_ADD_DEVICE);
    frame[2..4].copy_from_slice(&hdr.id.to_be_bytes());
    frame[4..6].copy_from_slice(&hdr.dev_info_size.to_be_bytes());
    frame[6..8].copy_from_slice(&hdr.dev_name_size.to_be_bytes());
    frame
}

/// Validates a received hello.
pub fn check_hello(pkt: &Packet) -> Result<()> {
    match *pkt {
        Packet::Hello { version, magic } => {
            if magic != HELLO_MAGIC {
                return Err(Error::protocol("bad hello packet magic"));
            }
            if version != PROTOCOL_VERSION {
                return Err(Error::Protocol(format!(
                    "protocol version mismatch: got {version}, expected {PROTOCOL_VERSION}"
                )));
            }
            Ok(())
        }
        _ => Err(Error::protocol(format!(
            "expected hello packet, got {pkt:?}"
        ))),
    }
}

/// Reads one frame; `Ok(None)` on a clean end of stream.
pub fn read_packet(fd: RawFd) -> Result<Option<Packet>> {
    let mut frame = [0u8; PACKET_SIZE];
    if !read_exact_fd(fd, &mut frame)? {
        return Ok(None);
    }
    Packet::decode(&frame).map(Some)
}

/// Reads and validates the hello that must open every netevent 2 stream.
pub fn read_hello(fd: RawFd) -> Result<()> {
    match read_packet(fd)? {
        Some(pkt) => check_hello(&pkt),
        None => Err(Error::protocol("end of stream while expecting hello")),
    }
}

/// Writes the hello frame that must open every netevent 2 stream.
pub fn write_hello(fd: RawFd) -> Result<()> {
    crate::write_all_fd(fd, &encode_hello())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EV_KEY;

    #[test]
    fn frame_is_28_bytes() {
        assert_eq!(PACKET_SIZE, 28);
    }

    #[test]
    fn hello_layout() {
        let frame = encode_hello();
        assert_eq!(&frame[0..2], &[0, 4]);
        assert_eq!(&frame[2..4], &[0, 2]);
        assert_eq!(&frame[4..12], b"NE2Hello");
        assert!(frame[12..].iter().all(|&b| b == 0));
        let pkt = Packet::decode(&frame).unwrap();
        assert!(check_hello(&pkt).is_ok());
    }

    #[test]
    fn hello_version_mismatch_message() {
        let mut frame = encode_hello();
        frame[2..4].copy_from_slice(&3u16.to_be_bytes());
        let pkt = Packet::decode(&frame).unwrap();
        let err = check_hello(&pkt).unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol error: protocol version mismatch: got 3, expected 2"
        );
    }

    #[test]
    fn hello_magic_mismatch() {
        let mut frame = encode_hello();
        frame[4] = b'X';
        let pkt = Packet::decode(&frame).unwrap();
        assert!(check_hello(&pkt).is_err());
    }

    #[test]
    fn device_event_round_trip() {
        let ev = InputEvent {
            tv_sec: 1,
            tv_usec: 2,
            ty: EV_KEY,
            code: 30,
            value: 1,
        };
        let frame = encode_device_event(7, &ev);
        assert_eq!(&frame[0..2], &[0, 3]);
        assert_eq!(&frame[2..4], &[0, 7]);
        match Packet::decode(&frame).unwrap() {
            Packet::DeviceEvent { id, event } => {
                assert_eq!(id, 7);
                assert_eq!(event, ev);
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn keep_alive_round_trip() {
        let frame = encode_keep_alive();
        assert!(frame[2..].iter().all(|&b| b == 0));
        assert_eq!(Packet::decode(&frame).unwrap(), Packet::KeepAlive);
    }

    #[test]
    fn remove_device_round_trip() {
        let frame = encode_remove_device(0x1234);
        match Packet::decode(&frame).unwrap() {
            Packet::RemoveDevice { id } => assert_eq!(id, 0x1234),
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn add_device_header_round_trip() {
        let hdr = AddDeviceHeader {
            id: 5,
            dev_info_size: 1116,
            dev_name_size: 80,
        };
        let frame = encode_add_device_header(&hdr);
        match Packet::decode(&frame).unwrap() {
            Packet::AddDevice(got) => assert_eq!(got, hdr),
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        let mut frame = [0u8; PACKET_SIZE];
        frame[0..2].copy_from_slice(&9u16.to_be_bytes());
        assert!(Packet::decode(&frame).is_err());
    }
}
