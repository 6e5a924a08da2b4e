use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use clap::{Parser, Subcommand, ValueEnum};

use netevent::daemon::Daemon;
use netevent::device::InDevice;
use netevent::error::{Error, Result};
use netevent::event::{self, InputEvent, WIRE_EVENT_SIZE};
use netevent::proto::{self, Packet};
use netevent::socket::{self, Listener};
use netevent::uinput::{DeviceSpec, OutDevice};
use netevent::{read_exact_fd, write_all_fd};

#[derive(Parser)]
#[command(name = "netevent", version, about = "Low-level sharing of Linux input devices")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum DuplicateMode {
    /// Treat duplicates as errors and exit
    Reject,
    /// Assume the devices are equivalent and resume them
    Resume,
    /// Remove the previous device and create a new one
    Replace,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CloseAction {
    End,
    Accept,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show input events of a device
    Show {
        /// Grab the device
        #[arg(short, long)]
        grab: bool,
        device: String,
        /// Show up to COUNT events (default 10)
        count: Option<u64>,
    },
    /// Dump a device on stdout in a netevent 1 or 2 compatible way
    Cat {
        /// Run in netevent 1 compatible mode
        #[arg(short, long)]
        legacy: bool,
        /// Grab the device (default)
        #[arg(short, long, overrides_with = "no_grab")]
        grab: bool,
        /// Do not grab the device
        #[arg(short = 'G', long)]
        no_grab: bool,
        device: String,
    },
    /// Create devices from a netevent stream
    Create {
        /// Run in netevent 1 compatible mode
        #[arg(short, long)]
        legacy: bool,
        /// How to deal with duplicate devices
        #[arg(short, long, value_enum, value_name = "MODE")]
        duplicates: Option<DuplicateMode>,
        /// Listen on a socket instead of reading from stdin
        #[arg(long, value_name = "SOCKSPEC")]
        listen: Option<String>,
        /// Whether to exit or restart on EOF
        #[arg(long, value_enum, value_name = "ACTION")]
        on_close: Option<CloseAction>,
        /// Fork off into the background
        #[arg(long)]
        daemonize: bool,
        /// Try to connect before creating a new instance
        #[arg(long)]
        connect: bool,
    },
    /// Run a device daemon
    Daemon {
        /// Run commands from FILE on startup
        #[arg(short, long = "source", value_name = "FILE")]
        source: Vec<String>,
        socket: String,
    },
    /// Send a runtime command to a daemon
    Command {
        socket: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            2
        }
    };
    std::process::exit(code);
}

fn run(cmd: Cmd) -> Result<i32> {
    match cmd {
        Cmd::Show {
            grab,
            device,
            count,
        } => cmd_show(&device, count, grab),
        Cmd::Cat {
            legacy,
            grab: _,
            no_grab,
            device,
        } => cmd_cat(&device, legacy, !no_grab),
        Cmd::Create {
            legacy,
            duplicates,
            listen,
            on_close,
            daemonize,
            connect,
        } => cmd_create(CreateOpts {
            legacy,
            duplicates,
            listen,
            on_close,
            daemonize,
            connect,
        }),
        Cmd::Daemon { source, socket } => cmd_daemon(&socket, &source),
        Cmd::Command { socket, command } => cmd_command(&socket, &command),
    }
}

fn cmd_show(device: &str, count: Option<u64>, grab: bool) -> Result<i32> {
    let mut dev = InDevice::open(device)?;
    if grab {
        dev.grab(true)?;
    }
    let max = count.unwrap_or(10);
    let mut ev = InputEvent::default();
    let mut shown = 0;
    while shown < max && dev.read(&mut ev)? {
        println!("{}:{}:{}", event::type_name(ev.ty), ev.code, ev.value);
        shown += 1;
    }
    Ok(0)
}

fn cmd_cat(device: &str, legacy: bool, grab: bool) -> Result<i32> {
    let mut dev = InDevice::open(device)?;
    if grab {
        dev.grab(true)?;
    }
    let out: RawFd = libc::STDOUT_FILENO;
    let mut ev = InputEvent::default();
    if legacy {
        dev.write_ne1_header(out)?;
        let mut buf = [0u8; WIRE_EVENT_SIZE];
        while dev.read(&mut ev)? {
            ev.encode_native(&mut buf);
            write_all_fd(out, &buf)?;
        }
    } else {
        proto::write_hello(out)?;
        dev.write_add_device(out, 0)?;
        while dev.read(&mut ev)? {
            write_all_fd(out, &proto::encode_device_event(0, &ev))?;
        }
    }
    Ok(0)
}

fn cmd_daemon(socket: &str, sources: &[String]) -> Result<i32> {
    let mut daemon = Daemon::new(socket)?;
    for path in sources {
        daemon.source_file(-1, path)?;
    }
    daemon.run()?;
    Ok(0)
}

fn read_some(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        match nix::errno::Errno::result(res) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(n) => return Ok(n as usize),
        }
    }
}

fn cmd_command(sockname: &str, words: &[String]) -> Result<i32> {
    if sockname.is_empty() {
        eprintln!("bad socket name");
        return Ok(3);
    }
    let command = words.join(" ");
    if command.is_empty() {
        return Ok(0);
    }

    let sock = socket::connect_spec(sockname)?;
    write_all_fd(sock.as_raw_fd(), command.as_bytes())?;
    nix::sys::socket::shutdown(sock.as_raw_fd(), nix::sys::socket::Shutdown::Write)?;

    let mut buf = [0u8; 1024];
    loop {
        let got = read_some(sock.as_raw_fd(), &mut buf)
            .map_err(|e| Error::config(format!("failed to read response: {e}")))?;
        if got == 0 {
            return Ok(0);
        }
        if write_all_fd(libc::STDOUT_FILENO, &buf[..got]).is_err() {
            // stdout is gone, nobody cares about the rest
            return Ok(-1);
        }
    }
}

struct CreateOpts {
    legacy: bool,
    duplicates: Option<DuplicateMode>,
    listen: Option<String>,
    on_close: Option<CloseAction>,
    daemonize: bool,
    connect: bool,
}

fn daemonize(can_close: bool) -> Result<()> {
    nix::unistd::daemon(true, !can_close)?;
    Ok(())
}

/// Copies `from` to `to` until EOF.
fn cat_fd(from: RawFd, to: RawFd) -> Result<i32> {
    let mut buf = [0u8; 1024];
    loop {
        let got = read_some(from, &mut buf)?;
        if got == 0 {
            return Ok(0);
        }
        write_all_fd(to, &buf[..got])?;
    }
}

fn cmd_create_legacy() -> Result<i32> {
    let mut out = OutDevice::from_ne1_stream(libc::STDIN_FILENO)?;
    let mut buf = [0u8; WIRE_EVENT_SIZE];
    while read_exact_fd(libc::STDIN_FILENO, &mut buf)? {
        out.write(&InputEvent::decode_native(&buf))?;
    }
    Ok(0)
}

fn cmd_create(opts: CreateOpts) -> Result<i32> {
    if opts.legacy
        && (opts.duplicates.is_some()
            || opts.listen.is_some()
            || opts.on_close.is_some()
            || opts.connect)
    {
        return Err(Error::config(
            "legacy mode does not support the provided parameters",
        ));
    }
    if opts.connect && opts.listen.is_none() {
        return Err(Error::config("--connect requires --listen"));
    }

    if opts.legacy {
        if opts.daemonize {
            daemonize(false)?;
        }
        return cmd_create_legacy();
    }

    let duplicates = opts.duplicates.unwrap_or(DuplicateMode::Reject);
    let on_close = opts.on_close.unwrap_or(CloseAction::Accept);

    let mut infd: RawFd = libc::STDIN_FILENO;
    let mut inhandle: Option<OwnedFd> = None;
    let mut server: Option<Listener> = None;

    if opts.connect {
        let spec = opts.listen.as_deref().expect("checked above");
        match socket::try_connect_spec(spec)? {
            Ok(out) => return cat_fd(libc::STDIN_FILENO, out.as_raw_fd()),
            Err(e) => {
                if !opts.daemonize || e != nix::errno::Errno::ECONNREFUSED {
                    return Err(Error::config(format!("failed to connect to {spec}: {e}")));
                }
            }
        }
        // Nobody is listening yet: fork a receiver; the parent becomes its
        // first client through a pipe.
        let (pr, pw) = nix::unistd::pipe()?;
        match unsafe { nix::unistd::fork() }? {
            nix::unistd::ForkResult::Parent { child } => {
                drop(pr);
                // wait for the daemonization
                let _ = nix::sys::wait::waitpid(child, None);
                return cat_fd(libc::STDIN_FILENO, pw.as_raw_fd());
            }
            nix::unistd::ForkResult::Child => {
                drop(pw);
                infd = pr.as_raw_fd();
                inhandle = Some(pr);
            }
        }
    }

    if let Some(spec) = &opts.listen {
        server = Some(Listener::bind(spec)?);
    }

    if opts.daemonize {
        daemonize(opts.listen.is_some())?;
    }

    if let Some(listener) = &server {
        if inhandle.is_none() {
            let fd = listener.accept()?;
            infd = fd.as_raw_fd();
            inhandle = Some(fd);
        }
    }
    if on_close == CloseAction::End {
        server = None;
    }

    proto::read_hello(infd)?;

    let mut devices: BTreeMap<u16, OutDevice> = BTreeMap::new();
    loop {
        while let Some(pkt) = proto::read_packet(infd)? {
            match pkt {
                Packet::Hello { .. } => proto::check_hello(&pkt)?,
                Packet::KeepAlive => {}
                Packet::AddDevice(hdr) => {
                    let id = hdr.id;
                    if duplicates == DuplicateMode::Replace || !devices.contains_key(&id) {
                        let spec = DeviceSpec::read_from(infd, &hdr)?;
                        devices.insert(id, OutDevice::from_spec(&spec)?);
                    } else if duplicates == DuplicateMode::Resume {
                        // consume the payload, keep the existing device
                        let _ = DeviceSpec::read_from(infd, &hdr)?;
                    } else {
                        return Err(Error::Protocol(format!(
                            "duplicate device {id}"
                        )));
                    }
                }
                Packet::RemoveDevice { id } => {
                    if devices.remove(&id).is_none() {
                        return Err(Error::Protocol(format!("missing device {id}")));
                    }
                }
                Packet::DeviceEvent { id, event } => {
                    devices
                        .get_mut(&id)
                        .ok_or_else(|| Error::Protocol(format!("missing device {id}")))?
                        .write(&event)?;
                }
            }
        }
        // clean EOF; in listen mode with on-close=accept, take the next
        // client and resume with the devices kept alive
        match &server {
            Some(listener) => {
                inhandle.take();
                let fd = listener.accept()?;
                infd = fd.as_raw_fd();
                inhandle = Some(fd);
            }
            None => break,
        }
    }
    Ok(0)
}
