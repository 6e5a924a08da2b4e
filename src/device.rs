//! Input sources: evdev nodes whose capabilities and events are mirrored
//! over the wire.

use std::fs::OpenOptions;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;

use nix::errno::Errno;

use crate::bitfield::BitField;
use crate::error::{Error, Result};
use crate::event::{InputEvent, EV_ABS, EV_MAX};
use crate::proto::{self, AddDeviceHeader};
use crate::{read_exact_fd, sys, write_all_fd};

pub const NAME_SIZE: usize = libc::UINPUT_MAX_NAME_SIZE;

pub(crate) unsafe fn struct_bytes<T>(v: &T) -> &[u8] {
    std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>())
}

/// Capability snapshot of an input device.
///
/// Captured once when the device is opened; only the advertised name may
/// change afterwards (via `device rename`).
pub struct DeviceCaps {
    /// Advertised name, NUL-padded.
    pub name: [u8; NAME_SIZE],
    pub id: libc::input_id,
    /// Event-type bits, `EV_MAX` of them.
    pub evbits: BitField,
    /// Per-type capability bits for the types that carry a sub-bitfield,
    /// ascending by type.
    pub type_bits: Vec<(u16, BitField)>,
    /// Axis information for every enabled absolute axis.
    pub abs_info: Vec<(u16, libc::input_absinfo)>,
}

impl DeviceCaps {
    fn query(fd: RawFd) -> Result<DeviceCaps> {
        let mut name = [0u8; NAME_SIZE];
        unsafe { sys::eviocgname(fd, &mut name) }
            .map_err(|e| Error::device(format!("failed to query device name: {e}")))?;

        let id = unsafe {
            let mut id = MaybeUninit::uninit();
            sys::eviocgid(fd, id.as_mut_ptr())
                .map_err(|e| Error::device(format!("failed to query device id: {e}")))?;
            id.assume_init()
        };

        let mut evbits = BitField::with_len(usize::from(EV_MAX));
        unsafe { sys::eviocgbit(fd, 0, evbits.as_mut_raw_slice()) }
            .map_err(|e| Error::device(format!("failed to query device capabilities: {e}")))?;

        let mut type_bits = Vec::new();
        let mut abs_info = Vec::new();
        for ev in evbits.iter_ones().collect::<Vec<_>>() {
            let ev = ev as u16;
            let Some(sub) = sys::sub_bits(ev) else {
                continue;
            };
            let mut bits = BitField::with_len(usize::from(sys::wire_bit_count(sub.max)));
            unsafe { sys::eviocgbit(fd, ev, bits.as_mut_raw_slice()) }.map_err(|e| {
                Error::device(format!("failed to query bits for event type {ev}: {e}"))
            })?;
            if ev == EV_ABS {
                for code in bits.iter_ones() {
                    let code = code as u16;
                    let mut ai: libc::input_absinfo = unsafe { std::mem::zeroed() };
                    unsafe { sys::eviocgabs(fd, code, &mut ai) }.map_err(|e| {
                        Error::device(format!("failed to query abs axis {code} info: {e}"))
                    })?;
                    abs_info.push((code, ai));
                }
            }
            type_bits.push((ev, bits));
        }

        Ok(DeviceCaps {
            name,
            id,
            evbits,
            type_bits,
            abs_info,
        })
    }

    /// The advertised name up to the first NUL.
    pub fn name_str(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    /// Serializes an `AddDevice` frame plus its full payload.
    pub fn encode_add_device(&self, id: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&proto::encode_add_device_header(&AddDeviceHeader {
            id,
            dev_info_size: std::mem::size_of::<libc::uinput_user_dev>() as u16,
            dev_name_size: NAME_SIZE as u16,
        }));

        out.extend_from_slice(&self.name);
        for field in [self.id.bustype, self.id.vendor, self.id.product, self.id.version] {
            out.extend_from_slice(&field.to_be_bytes());
        }

        out.extend_from_slice(&(self.evbits.len() as u16).to_be_bytes());
        out.extend_from_slice(self.evbits.as_raw_slice());

        for (_, bits) in &self.type_bits {
            out.extend_from_slice(&(bits.len() as u16).to_be_bytes());
            out.extend_from_slice(bits.as_raw_slice());
        }

        for (_, ai) in &self.abs_info {
            for field in [ai.value, ai.minimum, ai.maximum, ai.fuzz, ai.flat, ai.resolution] {
                out.extend_from_slice(&field.to_be_bytes());
            }
        }

        // State would follow here; nothing is transferred yet, so announce
        // an all-zero set of state types.
        let state = BitField::with_len(self.evbits.len());
        out.extend_from_slice(state.as_raw_slice());
        out
    }
}

/// An opened evdev node.
pub struct InDevice {
    fd: OwnedFd,
    caps: DeviceCaps,
    real_name: String,
    eof: bool,
    grabbing: bool,
    persistent: bool,
}

impl InDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<InDevice> {
        Self::_open(path.as_ref())
    }

    fn _open(path: &Path) -> Result<InDevice> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| Error::device(format!("failed to open {}: {e}", path.display())))?;
        let fd: OwnedFd = file.into();
        let caps = DeviceCaps::query(fd.as_raw_fd())?;
        let real_name = caps.name_str();
        Ok(InDevice {
            fd,
            caps,
            real_name,
            eof: false,
            grabbing: false,
            persistent: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_caps(fd: OwnedFd, caps: DeviceCaps) -> InDevice {
        let real_name = caps.name_str();
        InDevice {
            fd,
            caps,
            real_name,
            eof: false,
            grabbing: false,
            persistent: false,
        }
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// The currently advertised name.
    pub fn name(&self) -> String {
        self.caps.name_str()
    }

    /// The name the device itself reported when opened.
    pub fn real_name(&self) -> &str {
        &self.real_name
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, on: bool) {
        self.persistent = on;
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn grabbing(&self) -> bool {
        self.grabbing
    }

    /// Requests or releases exclusive access.
    ///
    /// Calls that would not change anything tolerate the errors the kernel
    /// reports for them (`EBUSY` when already grabbed by us, `EINVAL` when
    /// not grabbed).
    pub fn grab(&mut self, on: bool) -> Result<()> {
        let res = unsafe {
            sys::eviocgrab(
                self.fd.as_raw_fd(),
                on as nix::sys::ioctl::ioctl_param_type,
            )
        };
        match res {
            Ok(_) => {
                self.grabbing = on;
                Ok(())
            }
            Err(e) => {
                if on == self.grabbing && ((on && e == Errno::EBUSY) || (!on && e == Errno::EINVAL))
                {
                    return Ok(());
                }
                Err(Error::device(if on {
                    format!("failed to grab input device: {e}")
                } else {
                    format!("failed to release input device: {e}")
                }))
            }
        }
    }

    /// Blocking read of one event. Returns `Ok(false)` on end of stream.
    pub fn read(&mut self, out: &mut InputEvent) -> Result<bool> {
        let mut raw: libc::input_event = unsafe { std::mem::zeroed() };
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                &mut raw as *mut libc::input_event as *mut u8,
                std::mem::size_of::<libc::input_event>(),
            )
        };
        if !read_exact_fd(self.fd.as_raw_fd(), buf)? {
            self.eof = true;
            return Ok(false);
        }
        *out = InputEvent::from(raw);
        Ok(true)
    }

    /// Overrides the advertised name. Affects only future `AddDevice`
    /// announcements.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() >= NAME_SIZE {
            return Err(Error::config(format!(
                "name too long ({} > {})",
                bytes.len(),
                NAME_SIZE - 1
            )));
        }
        self.caps.name.fill(0);
        self.caps.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Restores the name the device reported when opened.
    pub fn reset_name(&mut self) -> Result<()> {
        let name = self.real_name.clone();
        self.set_name(&name)
    }

    /// Writes an `AddDevice` frame and payload describing this device.
    pub fn write_add_device(&self, fd: RawFd, id: u16) -> Result<()> {
        write_all_fd(fd, &self.caps.encode_add_device(id))
            .map_err(|e| Error::device(format!("failed to write device header: {e}")))
    }

    /// Writes the netevent 1 header: `uinput_user_dev` size, name, id,
    /// capability and state bits in the compat sizing, and the raw abs
    /// info table. Queries state live, as the legacy stream interleaves
    /// capabilities with the current device state.
    pub fn write_ne1_header(&self, fd: RawFd) -> Result<()> {
        let raw = self.fd.as_raw_fd();
        let strsz = std::mem::size_of::<libc::uinput_user_dev>() as u16;
        write_all_fd(fd, &strsz.to_ne_bytes())?;
        write_all_fd(fd, &self.caps.name)?;
        write_all_fd(fd, unsafe { struct_bytes(&self.caps.id) })?;
        write_all_fd(fd, self.caps.evbits.as_raw_slice())?;

        const ENTRY_TYPES: [(u16, u16); 6] = [
            (crate::event::EV_KEY, sys::KEY_MAX),
            (crate::event::EV_ABS, sys::ABS_MAX),
            (crate::event::EV_REL, sys::REL_MAX),
            (crate::event::EV_MSC, sys::MSC_MAX),
            (crate::event::EV_SW, sys::SW_MAX),
            (crate::event::EV_LED, sys::LED_MAX),
        ];
        let mut bits = BitField::new();
        for (ty, max) in ENTRY_TYPES {
            if !self.caps.evbits.get(usize::from(ty)) {
                continue;
            }
            bits.resize_ne1_compat(usize::from(max));
            bits.as_mut_raw_slice().fill(0);
            unsafe { sys::eviocgbit(raw, ty, bits.as_mut_raw_slice()) }
                .map_err(|e| Error::device(format!("failed to query type {ty} bits: {e}")))?;
            write_all_fd(fd, bits.as_raw_slice())?;
        }

        type StateIoctl = unsafe fn(RawFd, &mut [u8]) -> nix::Result<libc::c_int>;
        const STATE_TYPES: [(u16, u16, StateIoctl); 3] = [
            (crate::event::EV_KEY, sys::KEY_MAX, sys::eviocgkey),
            (crate::event::EV_LED, sys::LED_MAX, sys::eviocgled),
            (crate::event::EV_SW, sys::SW_MAX, sys::eviocgsw),
        ];
        for (ty, max, ioc) in STATE_TYPES {
            if !self.caps.evbits.get(usize::from(ty)) {
                continue;
            }
            bits.resize_ne1_compat(usize::from(max));
            bits.as_mut_raw_slice().fill(0);
            unsafe { ioc(raw, bits.as_mut_raw_slice()) }
                .map_err(|e| Error::device(format!("failed to query type {ty} state: {e}")))?;
            write_all_fd(fd, bits.as_raw_slice())?;
        }

        if self.caps.evbits.get(usize::from(EV_ABS)) {
            for code in 0..sys::ABS_MAX {
                let mut ai: libc::input_absinfo = unsafe { std::mem::zeroed() };
                unsafe { sys::eviocgabs(raw, code, &mut ai) }
                    .map_err(|e| Error::device(format!("failed to get abs axis {code}: {e}")))?;
                write_all_fd(fd, unsafe { struct_bytes(&ai) })?;
            }
        }
        Ok(())
    }
}

impl AsFd for InDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for InDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
