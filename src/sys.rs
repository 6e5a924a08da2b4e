use libc::{input_absinfo, input_id, uinput_abs_setup, uinput_setup};
use nix::{
    convert_ioctl_res, ioctl_none, ioctl_read, ioctl_read_buf, ioctl_write_int, ioctl_write_ptr,
    request_code_read,
};

use crate::event::{EV_ABS, EV_FF, EV_KEY, EV_LED, EV_MSC, EV_REL, EV_SND, EV_SW};

ioctl_read!(eviocgid, b'E', 0x02, input_id);
ioctl_read_buf!(eviocgname, b'E', 0x06, u8);
ioctl_read_buf!(eviocgkey, b'E', 0x18, u8);
ioctl_read_buf!(eviocgled, b'E', 0x19, u8);
ioctl_read_buf!(eviocgsw, b'E', 0x1b, u8);
ioctl_write_int!(eviocgrab, b'E', 0x90);

const UINPUT_IOCTL_BASE: u8 = b'U';
ioctl_none!(ui_dev_create, UINPUT_IOCTL_BASE, 1);
ioctl_none!(ui_dev_destroy, UINPUT_IOCTL_BASE, 2);
ioctl_write_ptr!(ui_dev_setup, UINPUT_IOCTL_BASE, 3, uinput_setup);
ioctl_write_ptr!(ui_abs_setup, UINPUT_IOCTL_BASE, 4, uinput_abs_setup);

ioctl_write_int!(ui_set_evbit, UINPUT_IOCTL_BASE, 100);
ioctl_write_int!(ui_set_keybit, UINPUT_IOCTL_BASE, 101);
ioctl_write_int!(ui_set_relbit, UINPUT_IOCTL_BASE, 102);
ioctl_write_int!(ui_set_absbit, UINPUT_IOCTL_BASE, 103);
ioctl_write_int!(ui_set_mscbit, UINPUT_IOCTL_BASE, 104);
ioctl_write_int!(ui_set_ledbit, UINPUT_IOCTL_BASE, 105);
ioctl_write_int!(ui_set_sndbit, UINPUT_IOCTL_BASE, 106);
ioctl_write_int!(ui_set_ffbit, UINPUT_IOCTL_BASE, 107);
ioctl_write_int!(ui_set_swbit, UINPUT_IOCTL_BASE, 109);

/// ioctl: "get event bits" for one event type (0 queries the type bits
/// themselves). The buffer length determines how many bits are fetched.
pub unsafe fn eviocgbit(
    fd: ::libc::c_int,
    ev_type: u16,
    buf: &mut [u8],
) -> ::nix::Result<::libc::c_int> {
    convert_ioctl_res!(::nix::libc::ioctl(
        fd,
        request_code_read!(b'E', 0x20 + u32::from(ev_type), buf.len()),
        buf.as_mut_ptr(),
    ))
}

/// ioctl: "get abs value/limits" for one absolute axis.
pub unsafe fn eviocgabs(
    fd: ::libc::c_int,
    abs: u16,
    buf: &mut input_absinfo,
) -> ::nix::Result<::libc::c_int> {
    assert!(usize::from(abs) < libc::ABS_CNT);
    convert_ioctl_res!(::nix::libc::ioctl(
        fd,
        request_code_read!(b'E', 0x40 + u32::from(abs), ::std::mem::size_of::<input_absinfo>()),
        buf as *mut input_absinfo
    ))
}

pub type SetBitFn =
    unsafe fn(::libc::c_int, ::nix::sys::ioctl::ioctl_param_type) -> ::nix::Result<::libc::c_int>;

pub const KEY_MAX: u16 = (libc::KEY_CNT - 1) as u16;
pub const REL_MAX: u16 = (libc::REL_CNT - 1) as u16;
pub const ABS_MAX: u16 = (libc::ABS_CNT - 1) as u16;
pub const MSC_MAX: u16 = (libc::MSC_CNT - 1) as u16;
pub const SW_MAX: u16 = (libc::SW_CNT - 1) as u16;
pub const LED_MAX: u16 = (libc::LED_CNT - 1) as u16;
pub const SND_MAX: u16 = (libc::SND_CNT - 1) as u16;
pub const FF_MAX: u16 = (libc::FF_CNT - 1) as u16;

/// Per-event-type capability description for the types uinput can enable
/// individual codes for. Only these carry a sub-bitfield on the wire.
pub struct SubBits {
    /// Highest valid code for the type.
    pub max: u16,
    /// The matching `UI_SET_*BIT` ioctl.
    pub set_bit: SetBitFn,
}

pub fn sub_bits(ev_type: u16) -> Option<SubBits> {
    let (max, set_bit): (u16, SetBitFn) = match ev_type {
        EV_KEY => (KEY_MAX, ui_set_keybit),
        EV_REL => (REL_MAX, ui_set_relbit),
        EV_ABS => (ABS_MAX, ui_set_absbit),
        EV_MSC => (MSC_MAX, ui_set_mscbit),
        EV_SW => (SW_MAX, ui_set_swbit),
        EV_LED => (LED_MAX, ui_set_ledbit),
        EV_SND => (SND_MAX, ui_set_sndbit),
        EV_FF => (FF_MAX, ui_set_ffbit),
        _ => return None,
    };
    Some(SubBits { max, set_bit })
}

/// Bit count used on the wire for a sub-bitfield: the type's code space
/// rounded up to a multiple of 64, the sizing senders have always used.
pub fn wire_bit_count(max: u16) -> u16 {
    ((u32::from(max) + 63) / 64 * 64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bit_counts_match_historical_sizing() {
        assert_eq!(wire_bit_count(KEY_MAX), 768);
        assert_eq!(wire_bit_count(REL_MAX), 64);
        assert_eq!(wire_bit_count(ABS_MAX), 64);
        assert_eq!(wire_bit_count(MSC_MAX), 64);
        assert_eq!(wire_bit_count(SW_MAX), 64);
        assert_eq!(wire_bit_count(LED_MAX), 64);
        assert_eq!(wire_bit_count(SND_MAX), 64);
        assert_eq!(wire_bit_count(FF_MAX), 128);
    }

    #[test]
    fn sub_bitfield_types() {
        for ty in [EV_KEY, EV_REL, EV_ABS, EV_MSC, EV_SW, EV_LED, EV_SND, EV_FF] {
            assert!(sub_bits(ty).is_some());
        }
        for ty in [crate::event::EV_SYN, crate::event::EV_REP, crate::event::EV_PWR] {
            assert!(sub_bits(ty).is_none());
        }
    }
}
