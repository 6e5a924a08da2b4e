//! Synthetic output devices: materializing wire descriptions via uinput.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;

use crate::bitfield::BitField;
use crate::device::{struct_bytes, NAME_SIZE};
use crate::error::{Error, Result};
use crate::event::{InputEvent, EV_ABS, EV_FF, EV_KEY, EV_LED, EV_MAX, EV_MSC, EV_REL, EV_SW};
use crate::proto::AddDeviceHeader;
use crate::{read_exact_fd, sys, write_all_fd};

const UINPUT_PATHS: [&str; 3] = ["/dev/uinput", "/dev/input/uinput", "/dev/misc/uinput"];

// Whether UI_DEV_SETUP works on the running kernel; flipped off once if
// the first attempt reports EINVAL, as with headers newer than the kernel.
static USE_UI_DEV_SETUP: AtomicBool = AtomicBool::new(true);

/// A device description decoded from an `AddDevice` payload.
///
/// Decoding is separate from materialization so that skipped duplicates
/// consume exactly the bytes a created device would.
pub struct DeviceSpec {
    pub name: [u8; NAME_SIZE],
    pub id: libc::input_id,
    pub evbits: BitField,
    pub type_bits: Vec<(u16, BitField)>,
    pub abs_info: Vec<(u16, libc::input_absinfo)>,
}

fn read_u16(fd: RawFd, what: &str) -> Result<u16> {
    let mut buf = [0u8; 2];
    if !read_exact_fd(fd, &mut buf)? {
        return Err(Error::protocol(format!("end of stream reading {what}")));
    }
    Ok(u16::from_be_bytes(buf))
}

fn read_bits(fd: RawFd, count: usize, what: &str) -> Result<BitField> {
    let mut bits = BitField::with_len(count);
    if !read_exact_fd(fd, bits.as_mut_raw_slice())? {
        return Err(Error::protocol(format!("end of stream reading {what}")));
    }
    Ok(bits)
}

impl DeviceSpec {
    /// Reads the payload following an `AddDevice` frame.
    pub fn read_from(fd: RawFd, header: &AddDeviceHeader) -> Result<DeviceSpec> {
        if usize::from(header.dev_info_size) != std::mem::size_of::<libc::uinput_user_dev>() {
            return Err(Error::protocol("struct uinput_user_dev size mismatch"));
        }
        if usize::from(header.dev_name_size) != NAME_SIZE {
            return Err(Error::protocol("input device name size mismatch"));
        }

        let mut name = [0u8; NAME_SIZE];
        if !read_exact_fd(fd, &mut name)? {
            return Err(Error::protocol("end of stream reading device name"));
        }

        let id = libc::input_id {
            bustype: read_u16(fd, "device id")?,
            vendor: read_u16(fd, "device id")?,
            product: read_u16(fd, "device id")?,
            version: read_u16(fd, "device id")?,
        };

        let evbitsize = read_u16(fd, "type bitfield size")?;
        if evbitsize != EV_MAX {
            return Err(Error::Protocol(format!(
                "event type count mismatch, got {evbitsize} != {EV_MAX}"
            )));
        }
        let evbits = read_bits(fd, usize::from(evbitsize), "event bits")?;

        let mut type_bits = Vec::new();
        let mut abs_info = Vec::new();
        for ev in evbits.iter_ones() {
            let ev = ev as u16;
            if sys::sub_bits(ev).is_none() {
                continue;
            }
            let count = read_u16(fd, "sub-bitfield size")?;
            let bits = read_bits(fd, usize::from(count), "sub-bitfield")?;
            type_bits.push((ev, bits));
        }

        if let Some((_, abs_bits)) = type_bits.iter().find(|(ev, _)| *ev == EV_ABS) {
            for code in abs_bits.iter_ones() {
                let mut buf = [0u8; 24];
                if !read_exact_fd(fd, &mut buf)? {
                    return Err(Error::protocol("end of stream reading abs axis info"));
                }
                let i32_at = |off: usize| i32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
                abs_info.push((
                    code as u16,
                    libc::input_absinfo {
                        value: i32_at(0),
                        minimum: i32_at(4),
                        maximum: i32_at(8),
                        fuzz: i32_at(12),
                        flat: i32_at(16),
                        resolution: i32_at(20),
                    },
                ));
            }
        }

        let state = read_bits(fd, usize::from(EV_MAX), "state bitfield")?;
        if state.any() {
            log::warn!("got unexpected state bits");
        }

        Ok(DeviceSpec {
            name,
            id,
            evbits,
            type_bits,
            abs_info,
        })
    }

    pub fn name_str(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}

/// A created uinput device.
pub struct OutDevice {
    fd: OwnedFd,
    user_dev: Box<libc::uinput_user_dev>,
    use_dev_setup: bool,
    created: bool,
}

impl OutDevice {
    fn open_uinput() -> Result<OwnedFd> {
        for path in UINPUT_PATHS {
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => return Ok(file.into()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::device(format!("error opening uinput device: {e}")))
                }
            }
        }
        Err(Error::device("cannot find uinput device node"))
    }

    fn new(name: &[u8; NAME_SIZE], id: libc::input_id) -> Result<OutDevice> {
        let fd = Self::open_uinput()?;

        let mut user_dev: Box<libc::uinput_user_dev> = Box::new(unsafe { std::mem::zeroed() });
        for (dst, &src) in user_dev.name.iter_mut().zip(name.iter()) {
            *dst = src as libc::c_char;
        }
        user_dev.id = id;
        // Force feedback replay is unsupported.
        user_dev.ff_effects_max = 0;

        let mut dev = OutDevice {
            fd,
            user_dev,
            use_dev_setup: USE_UI_DEV_SETUP.load(Ordering::Relaxed),
            created: false,
        };
        if !dev.use_dev_setup {
            return Ok(dev);
        }

        let mut setup: libc::uinput_setup = unsafe { std::mem::zeroed() };
        setup.id = id;
        setup.name = dev.user_dev.name;
        setup.ff_effects_max = 0;
        match unsafe { sys::ui_dev_setup(dev.fd.as_raw_fd(), &setup) } {
            Ok(_) => Ok(dev),
            Err(Errno::EINVAL) => {
                // Built with newer headers than the running kernel; fall
                // back to uploading the legacy uinput_user_dev on create.
                USE_UI_DEV_SETUP.store(false, Ordering::Relaxed);
                dev.use_dev_setup = false;
                Ok(dev)
            }
            Err(e) => Err(Error::device(format!("failed to setup uinput device: {e}"))),
        }
    }

    fn assert_not_created(&self, what: &str) -> Result<()> {
        if self.created {
            return Err(Error::device(format!("device already created: {what}")));
        }
        Ok(())
    }

    fn set_event_bit(&self, ty: u16) -> Result<()> {
        self.assert_not_created("trying to enable event type")?;
        unsafe {
            sys::ui_set_evbit(
                self.fd.as_raw_fd(),
                ty as nix::sys::ioctl::ioctl_param_type,
            )
        }
        .map_err(|e| Error::device(format!("failed to enable input bit {ty}: {e}")))?;
        Ok(())
    }

    fn set_code_bit(&self, set_bit: sys::SetBitFn, ty: u16, code: u16) -> Result<()> {
        self.assert_not_created("trying to enable event code")?;
        unsafe { (set_bit)(self.fd.as_raw_fd(), code as nix::sys::ioctl::ioctl_param_type) }
            .map_err(|e| Error::device(format!("failed to set type {ty} bit {code}: {e}")))?;
        Ok(())
    }

    fn setup_abs(&mut self, code: u16, info: &libc::input_absinfo) -> Result<()> {
        self.assert_not_created("trying to set absolute axis")?;
        if self.use_dev_setup {
            let setup = libc::uinput_abs_setup {
                code,
                absinfo: *info,
            };
            unsafe { sys::ui_abs_setup(self.fd.as_raw_fd(), &setup) }
                .map_err(|e| Error::device(format!("failed to setup device axis: {e}")))?;
            return Ok(());
        }
        let code = usize::from(code);
        self.user_dev.absmax[code] = info.maximum;
        self.user_dev.absmin[code] = info.minimum;
        self.user_dev.absfuzz[code] = info.fuzz;
        self.user_dev.absflat[code] = info.flat;
        Ok(())
    }

    fn create(&mut self) -> Result<()> {
        if !self.use_dev_setup {
            write_all_fd(self.fd.as_raw_fd(), unsafe { struct_bytes(&*self.user_dev) })
                .map_err(|e| Error::device(format!("failed to upload device info: {e}")))?;
        }
        unsafe { sys::ui_dev_create(self.fd.as_raw_fd()) }
            .map_err(|e| Error::device(format!("failed to create device: {e}")))?;
        self.created = true;
        Ok(())
    }

    /// Materializes a decoded device description.
    pub fn from_spec(spec: &DeviceSpec) -> Result<OutDevice> {
        let mut dev = Self::new(&spec.name, spec.id)?;
        for ev in spec.evbits.iter_ones() {
            let ev = ev as u16;
            if ev != EV_FF {
                dev.set_event_bit(ev)?;
            }
        }
        for (ev, bits) in &spec.type_bits {
            let sub = sys::sub_bits(*ev).expect("decoded sub-bitfield for unknown type");
            for code in bits.iter_ones() {
                dev.set_code_bit(sub.set_bit, *ev, code as u16)?;
            }
        }
        for (code, info) in &spec.abs_info {
            dev.setup_abs(*code, info)?;
        }
        dev.create()?;
        Ok(dev)
    }

    /// Reads a netevent 1 stream header and materializes the device.
    pub fn from_ne1_stream(fd: RawFd) -> Result<OutDevice> {
        let mut size = [0u8; 2];
        if !read_exact_fd(fd, &mut size)? {
            return Err(Error::protocol("end of stream reading device header"));
        }
        if usize::from(u16::from_ne_bytes(size)) != std::mem::size_of::<libc::uinput_user_dev>() {
            return Err(Error::protocol("struct uinput_user_dev size mismatch"));
        }

        let mut name = [0u8; NAME_SIZE];
        if !read_exact_fd(fd, &mut name)? {
            return Err(Error::protocol("error reading device name"));
        }
        let mut id: libc::input_id = unsafe { std::mem::zeroed() };
        {
            let buf = unsafe {
                std::slice::from_raw_parts_mut(
                    &mut id as *mut libc::input_id as *mut u8,
                    std::mem::size_of::<libc::input_id>(),
                )
            };
            if !read_exact_fd(fd, buf)? {
                return Err(Error::protocol("error reading device id"));
            }
        }

        let mut dev = Self::new(&name, id)?;

        let mut evbits = BitField::new();
        evbits.resize_ne1_compat(usize::from(EV_MAX));
        if !read_exact_fd(fd, evbits.as_mut_raw_slice())? {
            return Err(Error::protocol("error reading event bits"));
        }
        evbits.shrink_to(usize::from(EV_MAX));
        if usize::from(EV_FF) < evbits.len() {
            evbits.set(usize::from(EV_FF), false);
        }
        for ev in evbits.iter_ones().collect::<Vec<_>>() {
            dev.set_event_bit(ev as u16)?;
        }

        // The legacy stream carries exactly these, in this order.
        const ENTRY_TYPES: [(u16, u16); 6] = [
            (EV_KEY, sys::KEY_MAX),
            (EV_ABS, sys::ABS_MAX),
            (EV_REL, sys::REL_MAX),
            (EV_MSC, sys::MSC_MAX),
            (EV_SW, sys::SW_MAX),
            (EV_LED, sys::LED_MAX),
        ];
        let mut abs_bits = BitField::new();
        for (ty, max) in ENTRY_TYPES {
            if !evbits.get(usize::from(ty)) {
                continue;
            }
            let mut bits = BitField::new();
            bits.resize_ne1_compat(usize::from(max));
            if !read_exact_fd(fd, bits.as_mut_raw_slice())? {
                return Err(Error::protocol(format!("error reading type {ty} bits")));
            }
            bits.shrink_to(usize::from(max));
            let sub = sys::sub_bits(ty).expect("legacy entry type without setter");
            for code in bits.iter_ones() {
                dev.set_code_bit(sub.set_bit, ty, code as u16)?;
            }
            if ty == EV_ABS {
                abs_bits = bits;
            }
        }

        // Key, LED and switch state follow; netevent 1 only ever used them
        // to re-enable codes, so the data is consumed and dropped.
        const STATE_TYPES: [(u16, u16); 3] = [
            (EV_KEY, sys::KEY_MAX),
            (EV_LED, sys::LED_MAX),
            (EV_SW, sys::SW_MAX),
        ];
        for (ty, max) in STATE_TYPES {
            if !evbits.get(usize::from(ty)) {
                continue;
            }
            let mut bits = BitField::new();
            bits.resize_ne1_compat(usize::from(max));
            if !read_exact_fd(fd, bits.as_mut_raw_slice())? {
                return Err(Error::protocol(format!("error reading type {ty} state")));
            }
        }

        if evbits.get(usize::from(EV_ABS)) {
            for code in 0..sys::ABS_MAX {
                let mut ai: libc::input_absinfo = unsafe { std::mem::zeroed() };
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(
                        &mut ai as *mut libc::input_absinfo as *mut u8,
                        std::mem::size_of::<libc::input_absinfo>(),
                    )
                };
                if !read_exact_fd(fd, buf)? {
                    return Err(Error::protocol(format!(
                        "failed to read absolute axis {code}"
                    )));
                }
                if abs_bits.get(usize::from(code)) {
                    dev.setup_abs(code, &ai)?;
                }
            }
        }

        dev.create()?;
        Ok(dev)
    }

    /// Writes one event. Force feedback events are dropped.
    pub fn write(&mut self, ev: &InputEvent) -> Result<()> {
        if ev.ty == EV_FF {
            return Ok(());
        }
        let raw = ev.to_raw();
        write_all_fd(self.fd.as_raw_fd(), unsafe { struct_bytes(&raw) })
            .map_err(|e| Error::device(format!("failed to write event: {e}")))
    }
}

impl AsRawFd for OutDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for OutDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = sys::ui_dev_destroy(self.fd.as_raw_fd());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_caps::key_device;
    use crate::proto::{self, Packet};
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn spec_from_caps(caps: &crate::device::DeviceCaps, id: u16) -> (DeviceSpec, usize) {
        let bytes = caps.encode_add_device(id);
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut wfile = std::fs::File::from(w);
        wfile.write_all(&bytes).unwrap();
        drop(wfile);
        let pkt = proto::read_packet(r.as_raw_fd()).unwrap().unwrap();
        let hdr = match pkt {
            Packet::AddDevice(hdr) => hdr,
            other => panic!("wrong packet: {other:?}"),
        };
        let spec = DeviceSpec::read_from(r.as_raw_fd(), &hdr).unwrap();
        // the pipe must be fully drained
        let mut rest = [0u8; 1];
        assert!(!crate::read_exact_fd(r.as_raw_fd(), &mut rest).unwrap());
        (spec, bytes.len())
    }

    #[test]
    fn add_device_round_trip() {
        let caps = key_device("test", 30);
        let (spec, _) = spec_from_caps(&caps, 3);
        assert_eq!(spec.name_str(), "test");
        assert_eq!(spec.id.bustype, 1);
        assert_eq!(spec.id.version, 4);
        assert_eq!(
            spec.evbits.iter_ones().collect::<Vec<_>>(),
            caps.evbits.iter_ones().collect::<Vec<_>>()
        );
        assert_eq!(spec.type_bits.len(), 1);
        let (ev, bits) = &spec.type_bits[0];
        assert_eq!(*ev, EV_KEY);
        assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![30]);
        assert!(spec.abs_info.is_empty());
    }

    #[test]
    fn add_device_round_trip_with_abs() {
        let mut caps = key_device("pad", 0x110);
        caps.evbits.set(usize::from(EV_ABS), true);
        let mut abs = BitField::with_len(usize::from(sys::wire_bit_count(sys::ABS_MAX)));
        abs.set(0, true);
        abs.set(1, true);
        caps.type_bits.push((EV_ABS, abs));
        for code in [0u16, 1u16] {
            caps.abs_info.push((
                code,
                libc::input_absinfo {
                    value: 0,
                    minimum: -(code as i32 + 1) * 10,
                    maximum: (code as i32 + 1) * 10,
                    fuzz: 1,
                    flat: 2,
                    resolution: 3,
                },
            ));
        }
        let (spec, _) = spec_from_caps(&caps, 0);
        assert_eq!(spec.abs_info.len(), 2);
        let (code, ai) = &spec.abs_info[1];
        assert_eq!(*code, 1);
        assert_eq!(ai.minimum, -20);
        assert_eq!(ai.maximum, 20);
        assert_eq!(ai.resolution, 3);
    }

    #[test]
    fn bad_sizes_are_protocol_errors() {
        let hdr = crate::proto::AddDeviceHeader {
            id: 0,
            dev_info_size: 1,
            dev_name_size: 80,
        };
        let (r, _w) = nix::unistd::pipe().unwrap();
        assert!(matches!(
            DeviceSpec::read_from(r.as_raw_fd(), &hdr),
            Err(Error::Protocol(_))
        ));
    }
}
