//! Byte-order-normalized input events and event-type names.

use crate::command::parse_u64;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;
pub const EV_MSC: u16 = 0x04;
pub const EV_SW: u16 = 0x05;
pub const EV_LED: u16 = 0x11;
pub const EV_SND: u16 = 0x12;
pub const EV_REP: u16 = 0x14;
pub const EV_FF: u16 = 0x15;
pub const EV_PWR: u16 = 0x16;
pub const EV_FF_STATUS: u16 = 0x17;

pub const EV_MAX: u16 = (libc::EV_CNT - 1) as u16;
pub const EV_CNT: u16 = libc::EV_CNT as u16;

const EV_TYPE_NAMES: [(u16, &str); 12] = [
    (EV_SYN, "SYN"),
    (EV_KEY, "KEY"),
    (EV_REL, "REL"),
    (EV_ABS, "ABS"),
    (EV_MSC, "MSC"),
    (EV_SW, "SW"),
    (EV_LED, "LED"),
    (EV_SND, "SND"),
    (EV_REP, "REP"),
    (EV_FF, "FF"),
    (EV_PWR, "PWR"),
    (EV_FF_STATUS, "FF_STATUS"),
];

/// The symbolic name of an event type, or `<Unknown>`.
pub fn type_name(ty: u16) -> &'static str {
    EV_TYPE_NAMES
        .iter()
        .find(|(num, _)| *num == ty)
        .map(|(_, name)| *name)
        .unwrap_or("<Unknown>")
}

/// Parses an event type: a symbolic name (case-insensitive, with or
/// without the `EV_` prefix) or a number.
pub fn parse_type(text: &str) -> Option<u16> {
    let name = if text.len() >= 3 && text[..3].eq_ignore_ascii_case("EV_") {
        &text[3..]
    } else {
        text
    };
    for (num, known) in EV_TYPE_NAMES {
        if name.eq_ignore_ascii_case(known) {
            return Some(num);
        }
    }
    parse_u64(text).and_then(|n| u16::try_from(n).ok())
}

/// Size of one event on the wire: fixed-width time fields, type, code,
/// value and four bytes of padding.
pub const WIRE_EVENT_SIZE: usize = 24;

/// One input event in the normalized form used on the wire and in the
/// netevent 1 stream.
///
/// `struct input_event` embeds a `timeval` whose field widths differ
/// between architectures; this form pins every field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub tv_sec: u64,
    pub tv_usec: u32,
    pub ty: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    /// Serializes in network byte order into `out[..WIRE_EVENT_SIZE]`.
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.tv_sec.to_be_bytes());
        out[8..12].copy_from_slice(&self.tv_usec.to_be_bytes());
        out[12..14].copy_from_slice(&self.ty.to_be_bytes());
        out[14..16].copy_from_slice(&self.code.to_be_bytes());
        out[16..20].copy_from_slice(&self.value.to_be_bytes());
        out[20..24].fill(0);
    }

    /// Deserializes from network byte order.
    pub fn decode(buf: &[u8]) -> InputEvent {
        InputEvent {
            tv_sec: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            tv_usec: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            ty: u16::from_be_bytes(buf[12..14].try_into().unwrap()),
            code: u16::from_be_bytes(buf[14..16].try_into().unwrap()),
            value: i32::from_be_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    /// Serializes in host byte order, as the netevent 1 stream does.
    pub fn encode_native(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.tv_sec.to_ne_bytes());
        out[8..12].copy_from_slice(&self.tv_usec.to_ne_bytes());
        out[12..14].copy_from_slice(&self.ty.to_ne_bytes());
        out[14..16].copy_from_slice(&self.code.to_ne_bytes());
        out[16..20].copy_from_slice(&self.value.to_ne_bytes());
        out[20..24].fill(0);
    }

    /// Deserializes from host byte order.
    pub fn decode_native(buf: &[u8]) -> InputEvent {
        InputEvent {
            tv_sec: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            tv_usec: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
            ty: u16::from_ne_bytes(buf[12..14].try_into().unwrap()),
            code: u16::from_ne_bytes(buf[14..16].try_into().unwrap()),
            value: i32::from_ne_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    /// Converts to the kernel representation for writing to uinput.
    pub fn to_raw(self) -> libc::input_event {
        libc::input_event {
            time: libc::timeval {
                tv_sec: self.tv_sec as libc::time_t,
                tv_usec: self.tv_usec as libc::suseconds_t,
            },
            type_: self.ty,
            code: self.code,
            value: self.value,
        }
    }
}

impl From<libc::input_event> for InputEvent {
    fn from(raw: libc::input_event) -> Self {
        InputEvent {
            tv_sec: raw.time.tv_sec as u64,
            tv_usec: raw.time.tv_usec as u32,
            ty: raw.type_,
            code: raw.code,
            value: raw.value,
        }
    }
}
