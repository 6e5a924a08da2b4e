//! The daemon: one poll loop multiplexing grabbed input devices, output
//! sinks and control clients.
//!
//! All mutable state lives in [`Daemon`] and is only touched from the
//! loop. File descriptors are registered and dropped through deferred
//! queues so that handlers may remove any fd, including their own, while
//! dispatch is in progress.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Read as _;
use std::io::Write as _;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{SigHandler, Signal};

use crate::command::{self, parse_bool};
use crate::device::InDevice;
use crate::error::{Error, Result};
use crate::event::{self, InputEvent, EV_CNT};
use crate::proto;
use crate::socket::{self, Listener};
use crate::write_all_fd;

const OUTPUT_CHANGED_EVENT: &str = "output-changed";
const DEVICE_LOST_EVENT: &str = "device-lost";
const GRAB_CHANGED_EVENT: &str = "grab-changed";

const ACTION_EVENTS: [&str; 3] = [OUTPUT_CHANGED_EVENT, DEVICE_LOST_EVENT, GRAB_CHANGED_EVENT];

/// What an fd in the poll set belongs to; selects the dispatch and removal
/// behavior for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdRole {
    Server,
    Client,
    Input(u16),
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HotkeyDef {
    device: u16,
    ty: u16,
    code: u16,
    value: i32,
}

struct Input {
    id: u16,
    name: String,
    device: InDevice,
}

/// One attached output sink. All variants behave as an appendable byte
/// stream that is dropped on the first write error.
enum OutputSink {
    File(OwnedFd),
    Exec { fd: OwnedFd, child: Child },
    Socket(OwnedFd),
}

impl OutputSink {
    fn fd(&self) -> RawFd {
        match self {
            OutputSink::File(fd) => fd.as_raw_fd(),
            OutputSink::Exec { fd, .. } => fd.as_raw_fd(),
            OutputSink::Socket(fd) => fd.as_raw_fd(),
        }
    }
}

struct Client {
    stream: UnixStream,
    buf: Vec<u8>,
}

struct QueuedCommand {
    /// Originating client fd, or -1 for daemon-internal commands.
    client: RawFd,
    line: String,
}

pub struct Daemon {
    server: Listener,
    roles: BTreeMap<RawFd, FdRole>,
    poll_fds: Vec<RawFd>,
    add_queue: Vec<RawFd>,
    remove_queue: Vec<RawFd>,
    clients: BTreeMap<RawFd, Client>,
    command_queue: Vec<QueuedCommand>,
    inputs: Vec<Option<Input>>,
    input_names: BTreeMap<String, u16>,
    free_ids: Vec<u16>,
    outputs: BTreeMap<String, OutputSink>,
    current_output: Option<RawFd>,
    current_output_name: String,
    grabbing: bool,
    hotkeys: BTreeMap<HotkeyDef, String>,
    actions: BTreeMap<String, String>,
    zombies: Vec<Child>,
    quit: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(socket_spec: &str) -> Result<Daemon> {
        let server = Listener::bind(socket_spec)?;

        let quit = Arc::new(AtomicBool::new(false));
        let child_exited = Arc::new(AtomicBool::new(false));
        for sig in [
            signal_hook::consts::SIGINT,
            signal_hook::consts::SIGTERM,
            signal_hook::consts::SIGQUIT,
        ] {
            signal_hook::flag::register(sig, Arc::clone(&quit))?;
        }
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&child_exited))?;
        unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;

        let server_fd = server.as_raw_fd();
        let mut daemon = Daemon {
            server,
            roles: BTreeMap::new(),
            poll_fds: Vec::new(),
            add_queue: Vec::new(),
            remove_queue: Vec::new(),
            clients: BTreeMap::new(),
            command_queue: Vec::new(),
            inputs: Vec::new(),
            input_names: BTreeMap::new(),
            free_ids: Vec::new(),
            outputs: BTreeMap::new(),
            current_output: None,
            current_output_name: "<none>".to_string(),
            grabbing: false,
            hotkeys: BTreeMap::new(),
            actions: BTreeMap::new(),
            zombies: Vec::new(),
            quit,
            child_exited,
        };
        daemon.roles.insert(server_fd, FdRole::Server);
        daemon.poll_fds.push(server_fd);
        Ok(daemon)
    }

    fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }

    /// The poll/dispatch loop. Returns after a `quit` command or a
    /// termination signal.
    pub fn run(&mut self) -> Result<()> {
        while !self.quit_requested() {
            self.process_command_queue();
            self.poll_fds.append(&mut self.add_queue);
            self.process_remove_queue();
            if self.quit_requested() {
                break;
            }
            if self.child_exited.swap(false, Ordering::Relaxed) {
                self.reap_children();
            }

            let mut pfds: Vec<PollFd> = self
                .poll_fds
                .iter()
                .map(|&fd| {
                    PollFd::new(
                        unsafe { BorrowedFd::borrow_raw(fd) },
                        PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                    )
                })
                .collect();
            let ready: Vec<(RawFd, PollFlags)> = match poll(&mut pfds, PollTimeout::NONE) {
                Err(Errno::EINTR) => {
                    log::debug!("interrupted");
                    continue;
                }
                Err(e) => return Err(e.into()),
                Ok(_) => pfds
                    .iter()
                    .zip(self.poll_fds.iter())
                    .filter_map(|(pfd, &fd)| {
                        let revents = pfd.revents().unwrap_or_else(PollFlags::empty);
                        (!revents.is_empty()).then_some((fd, revents))
                    })
                    .collect(),
            };
            drop(pfds);

            for (fd, revents) in ready {
                if revents.contains(PollFlags::POLLERR) {
                    self.fd_lost(fd);
                }
                if self.quit_requested() {
                    break;
                }
                if revents.contains(PollFlags::POLLHUP) {
                    self.fd_lost(fd);
                }
                if self.quit_requested() {
                    break;
                }
                if revents.contains(PollFlags::POLLIN) {
                    self.fd_readable(fd);
                }
                if self.quit_requested() {
                    break;
                }
            }
        }
        log::info!("shutting down");
        Ok(())
    }

    // ---- fd bookkeeping -------------------------------------------------

    fn add_fd(&mut self, fd: RawFd) {
        self.add_queue.push(fd);
    }

    /// Queues `fd` for removal; idempotent while the removal is pending.
    fn remove_fd(&mut self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if !self.remove_queue.contains(&fd) {
            self.remove_queue.push(fd);
        }
    }

    fn process_remove_queue(&mut self) {
        // removal handlers may queue further removals; index, don't iterate
        let mut i = 0;
        while i < self.remove_queue.len() {
            let fd = self.remove_queue[i];
            i += 1;
            self.poll_fds.retain(|&f| f != fd);
            let Some(role) = self.roles.remove(&fd) else {
                log::error!("fd {fd} queued for removal without a role");
                debug_assert!(false, "fd queued for removal without a role");
                continue;
            };
            match role {
                FdRole::Server => log::error!("removed server socket"),
                FdRole::Client => {
                    self.clients.remove(&fd);
                }
                FdRole::Input(id) => self.finish_device_removal(id),
                FdRole::Output => self.finish_output_removal(fd),
            }
        }
        self.remove_queue.clear();
    }

    fn fd_lost(&mut self, fd: RawFd) {
        let Some(role) = self.roles.get(&fd).copied() else {
            return;
        };
        match role {
            FdRole::Server => self.quit.store(true, Ordering::Relaxed),
            FdRole::Client => self.remove_fd(fd),
            FdRole::Input(_) => {
                // HUP and IN often arrive together at EOF; the condition
                // fires once per lost device
                if !self.remove_queue.contains(&fd) {
                    self.fire_event(-1, DEVICE_LOST_EVENT);
                }
                self.remove_fd(fd);
            }
            FdRole::Output => self.remove_fd(fd),
        }
    }

    fn fd_readable(&mut self, fd: RawFd) {
        let Some(role) = self.roles.get(&fd).copied() else {
            return;
        };
        match role {
            FdRole::Server => self.accept_client(),
            FdRole::Client => self.read_client(fd),
            FdRole::Input(id) => self.read_from_device(id),
            FdRole::Output => {
                log::error!("read event on output");
                self.remove_fd(fd);
            }
        }
    }

    // ---- clients --------------------------------------------------------

    fn accept_client(&mut self) {
        match self.server.accept() {
            Ok(fd) => {
                let stream = UnixStream::from(fd);
                let raw = stream.as_raw_fd();
                self.add_fd(raw);
                self.roles.insert(raw, FdRole::Client);
                self.clients.insert(
                    raw,
                    Client {
                        stream,
                        buf: Vec::new(),
                    },
                );
            }
            Err(e) => log::error!("failed to accept client: {e}"),
        }
    }

    fn read_client(&mut self, fd: RawFd) {
        let mut chunk = [0u8; 4096];
        let got = {
            let Some(client) = self.clients.get_mut(&fd) else {
                return;
            };
            match client.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
                Err(e) => {
                    log::error!("error reading from command client: {e}");
                    self.remove_fd(fd);
                    return;
                }
            }
        };
        if got == 0 {
            let rest = self
                .clients
                .get_mut(&fd)
                .map(|c| std::mem::take(&mut c.buf))
                .unwrap_or_default();
            if !rest.is_empty() {
                self.queue_command(fd, String::from_utf8_lossy(&rest).into_owned());
            }
            self.remove_fd(fd);
            return;
        }
        let mut lines = Vec::new();
        if let Some(client) = self.clients.get_mut(&fd) {
            client.buf.extend_from_slice(&chunk[..got]);
            while let Some(pos) = client.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = client.buf.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        for line in lines {
            self.queue_command(fd, line);
        }
    }

    fn to_client(&mut self, fd: RawFd, text: &str) {
        if fd < 0 {
            eprint!("{text}");
            return;
        }
        let ok = match self.clients.get_mut(&fd) {
            Some(client) => client.stream.write_all(text.as_bytes()).is_ok(),
            None => {
                eprint!("{text}");
                return;
            }
        };
        if !ok {
            log::error!("failed to write response to client command");
            self.remove_fd(fd);
        }
    }

    // ---- command queue --------------------------------------------------

    fn queue_command(&mut self, client: RawFd, line: String) {
        self.command_queue.push(QueuedCommand { client, line });
    }

    fn process_command_queue(&mut self) {
        let queue = std::mem::take(&mut self.command_queue);
        for cmd in queue {
            if let Err(e) = self.run_command_line(cmd.client, &cmd.line) {
                self.to_client(cmd.client, &format!("ERROR: {e}\n"));
            }
        }
    }

    fn run_command_line(&mut self, client: RawFd, line: &str) -> Result<()> {
        for args in command::split_commands(line) {
            self.client_command(client, &args)?;
        }
        Ok(())
    }

    /// Looks up and runs a condition's action command, if one is set.
    fn fire_event(&mut self, client: RawFd, event: &str) {
        let Some(cmd) = self.actions.get(event).cloned() else {
            return;
        };
        if let Err(e) = self.run_command_line(client, &cmd) {
            self.to_client(client, &format!("ERROR: {e}\n"));
        }
    }

    // ---- inputs ---------------------------------------------------------

    fn next_input_id(&mut self) -> Result<u16> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        if self.inputs.len() > usize::from(u16::MAX) {
            return Err(Error::Exhaustion);
        }
        Ok(self.inputs.len() as u16)
    }

    fn input(&self, id: u16) -> Option<&Input> {
        self.inputs.get(usize::from(id)).and_then(Option::as_ref)
    }

    fn live_inputs(&self) -> impl Iterator<Item = &Input> {
        self.inputs.iter().flatten()
    }

    fn add_device(&mut self, name: &str, path: &str) -> Result<()> {
        if self.input_names.contains_key(name) {
            return Err(Error::config(format!("device already exists: {name}")));
        }
        let mut device = InDevice::open(path)?;
        if self.grabbing {
            device.grab(true)?;
        }
        let id = self.next_input_id()?;

        let output_fds: Vec<RawFd> = self.outputs.values().map(OutputSink::fd).collect();
        for ofd in output_fds {
            self.announce_device_to(&device, id, ofd);
        }

        let fd = device.as_raw_fd();
        self.add_fd(fd);
        self.roles.insert(fd, FdRole::Input(id));
        let input = Input {
            id,
            name: name.to_string(),
            device,
        };
        if usize::from(id) == self.inputs.len() {
            self.inputs.push(Some(input));
        } else {
            self.inputs[usize::from(id)] = Some(input);
        }
        self.input_names.insert(name.to_string(), id);
        Ok(())
    }

    fn find_device_id(&self, name: &str) -> Result<u16> {
        self.input_names
            .get(name)
            .copied()
            .ok_or_else(|| Error::config(format!("no such device: {name}")))
    }

    fn remove_device(&mut self, name: &str) -> Result<()> {
        let id = self.find_device_id(name)?;
        if let Some(input) = self.input(id) {
            self.remove_fd(input.device.as_raw_fd());
        }
        Ok(())
    }

    fn finish_device_removal(&mut self, id: u16) {
        let Some(input) = self.inputs.get_mut(usize::from(id)).and_then(Option::take) else {
            log::error!("device removal for unknown id {id}");
            return;
        };
        if !input.device.persistent() {
            self.announce_device_removal(id);
        }
        self.hotkeys.retain(|key, _| key.device != id);
        self.input_names.remove(&input.name);
        self.free_ids.push(id);
    }

    fn read_from_device(&mut self, id: u16) {
        let mut ev = InputEvent::default();
        let res = {
            let Some(input) = self.inputs.get_mut(usize::from(id)).and_then(Option::as_mut)
            else {
                return;
            };
            input.device.read(&mut ev)
        };
        let input_fd = match self.input(id) {
            Some(input) => input.device.as_raw_fd(),
            None => return,
        };
        match res {
            Ok(true) => {}
            Ok(false) => {
                if !self.remove_queue.contains(&input_fd) {
                    self.fire_event(-1, DEVICE_LOST_EVENT);
                }
                self.remove_fd(input_fd);
                return;
            }
            Err(e) => {
                log::error!("error reading device: {e}");
                if !self.remove_queue.contains(&input_fd) {
                    self.fire_event(-1, DEVICE_LOST_EVENT);
                }
                self.remove_fd(input_fd);
                return;
            }
        }

        if self.try_hotkey(id, ev.ty, ev.code, ev.value) {
            return;
        }
        let Some(out_fd) = self.current_output else {
            return;
        };
        // events are only forwarded while grabbing
        if !self.grabbing {
            return;
        }
        let frame = proto::encode_device_event(id, &ev);
        let Err(e) = write_all_fd(out_fd, &frame) else {
            return;
        };
        log::error!("error writing to output {}: {e}", self.current_output_name);
        self.remove_fd(out_fd);
        self.lost_current_output();
    }

    // ---- announcements --------------------------------------------------

    fn write_to_output(&mut self, fd: RawFd, data: &[u8]) -> bool {
        if write_all_fd(fd, data).is_ok() {
            return true;
        }
        log::error!("error writing to output, dropping");
        self.remove_fd(fd);
        false
    }

    fn announce_device_to(&mut self, device: &InDevice, id: u16, fd: RawFd) -> bool {
        if let Err(e) = device.write_add_device(fd, id) {
            log::error!("error creating device on output, dropping: {e}");
            self.remove_fd(fd);
            return false;
        }
        true
    }

    fn announce_all_devices(&mut self, fd: RawFd) {
        let ids: Vec<u16> = self.live_inputs().map(|i| i.id).collect();
        for id in ids {
            let res = match self.input(id) {
                Some(input) => input.device.write_add_device(fd, id),
                None => continue,
            };
            if let Err(e) = res {
                log::error!("error creating device on output, dropping: {e}");
                self.remove_fd(fd);
                break;
            }
        }
    }

    fn announce_device_removal(&mut self, id: u16) {
        let frame = proto::encode_remove_device(id);
        let output_fds: Vec<RawFd> = self.outputs.values().map(OutputSink::fd).collect();
        for fd in output_fds {
            self.write_to_output(fd, &frame);
        }
    }

    // ---- outputs --------------------------------------------------------

    fn add_output(&mut self, name: &str, spec: &str, skip_announce: bool) -> Result<()> {
        if self.outputs.contains_key(name) {
            return Err(Error::config(format!("output already exists: {name}")));
        }

        let sink = if let Some(cmd) = spec.strip_prefix("exec:") {
            let mut child = Command::new("/bin/sh")
                .arg("-c")
                .arg(cmd)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| Error::config(format!("failed to spawn shell: {e}")))?;
            let stdin = child.stdin.take().expect("piped child stdin");
            OutputSink::Exec {
                fd: stdin.into(),
                child,
            }
        } else if let Some(path) = spec.strip_prefix("unix:") {
            OutputSink::Socket(socket::connect_spec(path)?)
        } else {
            // O_NONBLOCK so a FIFO without a reader fails right away
            // instead of hanging the loop; cleared again below.
            let file = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(spec)
                .map_err(|e| Error::config(format!("open({spec}): {e}")))?;
            let fd: OwnedFd = file.into();
            let flags = nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFL)?;
            let flags = nix::fcntl::OFlag::from_bits_retain(flags) & !nix::fcntl::OFlag::O_NONBLOCK;
            nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_SETFL(flags))?;
            OutputSink::File(fd)
        };

        let fd = sink.fd();
        proto::write_hello(fd)?;
        if !skip_announce {
            self.announce_all_devices(fd);
        }
        self.outputs.insert(name.to_string(), sink);
        self.roles.insert(fd, FdRole::Output);
        self.add_fd(fd);
        Ok(())
    }

    fn remove_output(&mut self, name: &str) -> Result<()> {
        let fd = self
            .outputs
            .get(name)
            .map(OutputSink::fd)
            .ok_or_else(|| Error::config(format!("no such output: {name}")))?;
        self.remove_fd(fd);
        Ok(())
    }

    fn finish_output_removal(&mut self, fd: RawFd) {
        if self.current_output == Some(fd) {
            self.lost_current_output();
        }
        let name = self
            .outputs
            .iter()
            .find(|(_, sink)| sink.fd() == fd)
            .map(|(name, _)| name.clone());
        match name {
            Some(name) => {
                if let Some(OutputSink::Exec { child, .. }) = self.outputs.remove(&name) {
                    // stdin just closed with the fd; the child is reaped
                    // from the SIGCHLD sweep
                    self.zombies.push(child);
                }
            }
            None => log::error!("output removal for unknown fd {fd}"),
        }
    }

    fn use_output(&mut self, client: RawFd, name: &str) -> Result<()> {
        let fd = self
            .outputs
            .get(name)
            .map(OutputSink::fd)
            .ok_or_else(|| Error::config(format!("no such output: {name}")))?;
        self.current_output = Some(fd);
        self.current_output_name = name.to_string();
        std::env::set_var("NETEVENT_OUTPUT_NAME", name);
        self.fire_event(client, OUTPUT_CHANGED_EVENT);
        Ok(())
    }

    fn lost_current_output(&mut self) {
        self.current_output = None;
        self.current_output_name = "<none>".to_string();
        if self.grabbing {
            self.apply_grab(-1, false);
        }
    }

    // ---- grab and hotkeys -----------------------------------------------

    fn apply_grab(&mut self, client: RawFd, on: bool) {
        self.grabbing = on;
        let value = if on { "1" } else { "0" };
        std::env::set_var("NETEVENT_GRABBING", value);
        std::env::set_var("GRAB", value);
        for input in self.inputs.iter_mut().flatten() {
            if let Err(e) = input.device.grab(on) {
                log::warn!("{}: {e}", input.name);
            }
        }
        self.fire_event(client, GRAB_CHANGED_EVENT);
    }

    fn try_hotkey(&mut self, device: u16, ty: u16, code: u16, value: i32) -> bool {
        if ty >= EV_CNT {
            return false;
        }
        let key = HotkeyDef {
            device,
            ty,
            code,
            value,
        };
        let Some(cmd) = self.hotkeys.get(&key).cloned() else {
            return false;
        };
        self.queue_command(-1, cmd);
        true
    }

    fn parse_hotkey(&self, device: &str, def: &str) -> Result<HotkeyDef> {
        let id = self.find_device_id(device)?;
        let mut parts = def.splitn(3, ':');
        let (ty_s, code_s, value_s) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(c), Some(v)) if !t.is_empty() && !c.is_empty() && !v.is_empty() => {
                (t, c, v)
            }
            _ => {
                return Err(Error::config(format!("invalid hotkey definition: {def}")));
            }
        };
        let ty = event::parse_type(ty_s)
            .ok_or_else(|| Error::config(format!("no such event type: {ty_s}")))?;
        if ty >= EV_CNT {
            return Err(Error::config(format!("bad event type: {ty}")));
        }
        let code = command::parse_u64(code_s)
            .and_then(|c| u16::try_from(c).ok())
            .ok_or_else(|| Error::config(format!("bad event code: {code_s}")))?;
        let value = command::parse_i64(value_s)
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| Error::config(format!("bad event value: {value_s}")))?;
        Ok(HotkeyDef {
            device: id,
            ty,
            code,
            value,
        })
    }

    // ---- children -------------------------------------------------------

    fn shell_command(&mut self, cmd: &str) -> Result<()> {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .map_err(|e| Error::config(format!("failed to run shell: {e}")))?;
        Ok(())
    }

    fn reap_children(&mut self) {
        self.zombies
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
        for sink in self.outputs.values_mut() {
            if let OutputSink::Exec { child, .. } = sink {
                let _ = child.try_wait();
            }
        }
    }

    // ---- command handlers -----------------------------------------------

    /// Runs commands from a file; `#`-comments and blank lines are
    /// skipped.
    pub fn source_file(&mut self, client: RawFd, path: &str) -> Result<()> {
        let raw =
            std::fs::read(path).map_err(|e| Error::config(format!("open({path}): {e}")))?;
        let content = String::from_utf8_lossy(&raw);
        for line in content.lines() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.run_command_line(client, line)?;
        }
        Ok(())
    }

    fn cmd_device(&mut self, client: RawFd, args: &[String]) -> Result<()> {
        let sub = args
            .get(1)
            .ok_or_else(|| Error::config("'device': missing subcommand"))?;
        match sub.as_str() {
            "add" => {
                if args.len() != 4 {
                    return Err(Error::config("'device add' requires a name and a path"));
                }
                self.add_device(&args[2], &args[3])?;
                self.to_client(client, &format!("added device {}\n", args[2]));
            }
            "remove" => {
                if args.len() != 3 {
                    return Err(Error::config("'device remove' requires a name"));
                }
                self.remove_device(&args[2])?;
                self.to_client(client, &format!("removing device {}\n", args[2]));
            }
            "rename" => {
                if args.len() != 4 {
                    return Err(Error::config("'device rename' requires a device and a name"));
                }
                let id = self.find_device_id(&args[2])?;
                let real = {
                    let input = self.inputs[usize::from(id)].as_mut().expect("live input");
                    input.device.set_name(&args[3])?;
                    input.device.real_name().to_string()
                };
                self.to_client(client, &format!("renamed device {real} to {}\n", args[3]));
            }
            "reset-name" => {
                if args.len() != 3 {
                    return Err(Error::config("'device reset-name' requires a device"));
                }
                let id = self.find_device_id(&args[2])?;
                let real = {
                    let input = self.inputs[usize::from(id)].as_mut().expect("live input");
                    input.device.reset_name()?;
                    input.device.real_name().to_string()
                };
                self.to_client(client, &format!("reset name of device {real}\n"));
            }
            "set-persistent" => {
                if args.len() != 4 {
                    return Err(Error::config(
                        "'device set-persistent' requires a device and a boolean",
                    ));
                }
                let id = self.find_device_id(&args[2])?;
                match parse_bool(&args[3]) {
                    Some(value) => {
                        self.inputs[usize::from(id)]
                            .as_mut()
                            .expect("live input")
                            .device
                            .set_persistent(value);
                        let what = if value { "persistent" } else { "removable" };
                        self.to_client(client, &format!("device {} made {what}\n", args[2]));
                    }
                    None => {
                        self.to_client(client, &format!("not a boolean: '{}'\n", args[3]));
                    }
                }
            }
            other => {
                return Err(Error::config(format!("unknown device subcommand: {other}")));
            }
        }
        Ok(())
    }

    fn cmd_output(&mut self, client: RawFd, args: &[String]) -> Result<()> {
        let sub = args
            .get(1)
            .ok_or_else(|| Error::config("'output': missing subcommand"))?;
        match sub.as_str() {
            "add" => {
                let mut at = 2;
                let mut skip_announce = false;
                if args.get(at).map(String::as_str) == Some("--resume") {
                    at += 1;
                    skip_announce = true;
                }
                if at + 1 >= args.len() {
                    return Err(Error::config("'output add' requires a name and a path"));
                }
                let name = args[at].clone();
                let spec = args[at + 1..].join(" ");
                self.add_output(&name, &spec, skip_announce)?;
                self.to_client(client, &format!("added output {name}\n"));
            }
            "remove" => {
                if args.len() != 3 {
                    return Err(Error::config("'output remove' requires a name"));
                }
                self.remove_output(&args[2])?;
                self.to_client(client, &format!("removing output {}\n", args[2]));
            }
            "use" => {
                if args.len() != 3 {
                    return Err(Error::config("'output use' requires a name"));
                }
                self.use_output(client, &args[2])?;
                self.to_client(client, &format!("output = {}\n", self.current_output_name));
            }
            other => {
                return Err(Error::config(format!("unknown output subcommand: {other}")));
            }
        }
        Ok(())
    }

    fn cmd_hotkey(&mut self, client: RawFd, args: &[String]) -> Result<()> {
        let sub = args
            .get(1)
            .ok_or_else(|| Error::config("'hotkey': missing subcommand"))?;
        match sub.as_str() {
            "add" => {
                if args.len() < 5 {
                    return Err(Error::config(
                        "'hotkey add' requires a device, a hotkey and a command",
                    ));
                }
                let key = self.parse_hotkey(&args[2], &args[3])?;
                let cmd = args[4..].join(" ");
                self.hotkeys.insert(key, cmd);
                self.to_client(
                    client,
                    &format!(
                        "added hotkey {}:{}:{} for device {}\n",
                        key.ty, key.code, key.value, key.device
                    ),
                );
            }
            "remove" => {
                if args.len() != 4 {
                    return Err(Error::config(
                        "'hotkey remove' requires a device and an event code",
                    ));
                }
                let key = self.parse_hotkey(&args[2], &args[3])?;
                self.hotkeys.remove(&key);
                self.to_client(
                    client,
                    &format!(
                        "removed hotkey {}:{}:{} for device {}\n",
                        key.ty, key.code, key.value, key.device
                    ),
                );
            }
            other => {
                return Err(Error::config(format!("unknown hotkey subcommand: {other}")));
            }
        }
        Ok(())
    }

    fn cmd_action(&mut self, client: RawFd, args: &[String]) -> Result<()> {
        let sub = args
            .get(1)
            .ok_or_else(|| Error::config("'action': missing subcommand"))?;
        let action = args
            .get(2)
            .ok_or_else(|| Error::config("'action': missing action"))?
            .clone();
        match sub.as_str() {
            "remove" => {
                if args.len() != 3 {
                    return Err(Error::config("'action': excess parameters"));
                }
                if self.actions.remove(&action).is_some() {
                    self.to_client(client, &format!("removed on-'{action}' command\n"));
                }
            }
            "set" => {
                if args.len() < 4 {
                    return Err(Error::config("'action': missing command"));
                }
                if !ACTION_EVENTS.contains(&action.as_str()) {
                    return Err(Error::config(format!("unknown action event: {action}")));
                }
                let cmd = args[3..].join(" ");
                let what = if self.actions.insert(action.clone(), cmd).is_some() {
                    "replaced"
                } else {
                    "added"
                };
                self.to_client(client, &format!("{what} on-'{action}' command\n"));
            }
            other => {
                return Err(Error::config(format!("'action': unknown subcommand: {other}")));
            }
        }
        Ok(())
    }

    fn cmd_grab(&mut self, client: RawFd, state: &str) -> Result<()> {
        let on = match parse_bool(state) {
            Some(v) => v,
            None if state.eq_ignore_ascii_case("toggle") => !self.grabbing,
            None => {
                return Err(Error::config(format!("unknown grab state: {state}")));
            }
        };
        self.apply_grab(client, on);
        Ok(())
    }

    fn cmd_info(&mut self, client: RawFd) {
        let mut text = String::new();
        let _ = writeln!(text, "Grab: {}", if self.grabbing { "on" } else { "off" });
        let _ = writeln!(text, "Inputs: {}", self.live_inputs().count());
        for input in self.live_inputs() {
            let _ = writeln!(
                text,
                "    {}: {}: {}",
                input.id,
                input.name,
                input.device.as_raw_fd()
            );
        }
        let _ = writeln!(text, "Outputs: {}", self.outputs.len());
        for (name, sink) in &self.outputs {
            let _ = writeln!(text, "    {name}: {}", sink.fd());
        }
        let _ = writeln!(
            text,
            "Current output: {}: {}",
            self.current_output.unwrap_or(-1),
            self.current_output_name
        );
        let _ = writeln!(text, "Hotkeys:");
        for (key, cmd) in &self.hotkeys {
            let _ = writeln!(
                text,
                "    {}: {}:{}:{} => {cmd}",
                key.device,
                event::type_name(key.ty),
                key.code,
                key.value
            );
        }
        let _ = writeln!(text, "Event actions:");
        for (event, cmd) in &self.actions {
            let _ = writeln!(text, "    '{event}': {cmd}");
        }
        self.to_client(client, &text);
    }

    fn client_command(&mut self, client: RawFd, args: &[String]) -> Result<()> {
        let Some(verb) = args.first() else {
            return Ok(());
        };
        match verb.as_str() {
            "nop" => {}
            "device" => self.cmd_device(client, args)?,
            "output" => self.cmd_output(client, args)?,
            "hotkey" => self.cmd_hotkey(client, args)?,
            "action" => self.cmd_action(client, args)?,
            "info" => self.cmd_info(client),
            "grab" => {
                if args.len() != 2 {
                    return Err(Error::config("'grab' requires 1 parameter"));
                }
                self.cmd_grab(client, &args[1])?;
            }
            "use" => {
                if args.len() != 2 {
                    return Err(Error::config("'use' requires 1 parameter"));
                }
                self.use_output(client, &args[1])?;
            }
            "exec" => {
                if args.len() < 2 {
                    return Err(Error::config("'exec' requires 1 parameter"));
                }
                let cmd = args[1..].join(" ");
                self.shell_command(&cmd)?;
            }
            "source" => {
                if args.len() != 2 {
                    return Err(Error::config("'source' requires 1 parameter"));
                }
                self.source_file(client, &args[1])?;
            }
            "quit" => self.quit.store(true, Ordering::Relaxed),
            other => {
                return Err(Error::config(format!("unknown command: {other}")));
            }
        }
        if client >= 0 {
            self.to_client(client, "Ok.\n");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_caps::key_device;
    use crate::device::{struct_bytes, DeviceCaps};
    use crate::event::{EV_KEY, EV_MAX};
    use crate::proto::{Packet, PACKET_SIZE};

    fn test_daemon(tag: &str) -> Daemon {
        Daemon::new(&format!("@netevent-daemon-test-{}-{tag}", std::process::id())).unwrap()
    }

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("netevent-daemon-{}-{tag}", std::process::id()))
    }

    /// Registers a pipe-backed input, returning its id and the write end.
    fn inject_input(d: &mut Daemon, name: &str, caps: DeviceCaps) -> (u16, OwnedFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        let device = InDevice::with_caps(r, caps);
        let id = d.next_input_id().unwrap();
        let fd = device.as_raw_fd();
        d.poll_fds.push(fd);
        d.roles.insert(fd, FdRole::Input(id));
        let input = Input {
            id,
            name: name.to_string(),
            device,
        };
        if usize::from(id) == d.inputs.len() {
            d.inputs.push(Some(input));
        } else {
            d.inputs[usize::from(id)] = Some(input);
        }
        d.input_names.insert(name.to_string(), id);
        (id, w)
    }

    fn feed_event(w: &OwnedFd, ty: u16, code: u16, value: i32) {
        let raw = InputEvent {
            tv_sec: 1,
            tv_usec: 2,
            ty,
            code,
            value,
        }
        .to_raw();
        crate::write_all_fd(w.as_raw_fd(), unsafe { struct_bytes(&raw) }).unwrap();
    }

    fn run_line(d: &mut Daemon, line: &str) {
        d.run_command_line(-1, line).unwrap();
    }

    /// `output add` opens without O_CREAT, so the file must exist first.
    fn add_file_output(d: &mut Daemon, name: &str, path: &std::path::Path) {
        std::fs::write(path, b"").unwrap();
        run_line(d, &format!("output add {name} {}", path.display()));
    }

    fn drain_queues(d: &mut Daemon) {
        d.process_command_queue();
        let mut add = std::mem::take(&mut d.add_queue);
        d.poll_fds.append(&mut add);
        d.process_remove_queue();
    }

    #[test]
    fn free_ids_are_reused() {
        let mut d = test_daemon("freelist");
        let (id0, _w0) = inject_input(&mut d, "a", key_device("a", 30));
        let (id1, _w1) = inject_input(&mut d, "b", key_device("b", 30));
        assert_eq!((id0, id1), (0, 1));
        run_line(&mut d, "device remove a");
        drain_queues(&mut d);
        assert!(d.input_names.get("a").is_none());
        let (id2, _w2) = inject_input(&mut d, "c", key_device("c", 30));
        assert_eq!(id2, 0);
    }

    #[test]
    fn hotkey_suppresses_event_and_queues_command() {
        let mut d = test_daemon("hotkey");
        let out = temp_path("hotkey-out");
        add_file_output(&mut d, "main", &out);
        run_line(&mut d, "use main");
        let (id, w) = inject_input(&mut d, "devA", key_device("devA", 161));
        d.grabbing = true;
        run_line(&mut d, "hotkey add devA EV_KEY:161:0 quit");
        assert_eq!(d.hotkeys.len(), 1);

        feed_event(&w, EV_KEY, 161, 0);
        d.read_from_device(id);
        assert_eq!(d.command_queue.len(), 1);
        assert_eq!(d.command_queue[0].client, -1);
        assert_eq!(d.command_queue[0].line, "quit");

        // nothing besides the hello may have reached the output
        let written = std::fs::read(&out).unwrap();
        assert_eq!(written.len(), PACKET_SIZE);

        // and the queued command quits the daemon when processed
        d.process_command_queue();
        assert!(d.quit_requested());
        let _ = std::fs::remove_file(&out);
    }

    #[test]
    fn events_forward_only_while_grabbing() {
        let mut d = test_daemon("forward");
        let out = temp_path("forward-out");
        add_file_output(&mut d, "main", &out);
        run_line(&mut d, "use main");
        let (id, w) = inject_input(&mut d, "kbd", key_device("kbd", 30));

        feed_event(&w, EV_KEY, 30, 1);
        d.read_from_device(id);
        assert_eq!(std::fs::read(&out).unwrap().len(), PACKET_SIZE); // hello only

        d.grabbing = true;
        feed_event(&w, EV_KEY, 30, 1);
        d.read_from_device(id);
        let written = std::fs::read(&out).unwrap();
        assert_eq!(written.len(), 2 * PACKET_SIZE);
        let frame: [u8; PACKET_SIZE] = written[PACKET_SIZE..].try_into().unwrap();
        match Packet::decode(&frame).unwrap() {
            Packet::DeviceEvent { id: got, event } => {
                assert_eq!(got, id);
                assert_eq!(event.ty, EV_KEY);
                assert_eq!(event.code, 30);
                assert_eq!(event.value, 1);
            }
            other => panic!("wrong packet: {other:?}"),
        }
        let _ = std::fs::remove_file(&out);
    }

    #[test]
    fn write_error_drops_output_and_releases_grab() {
        let mut d = test_daemon("writeerr");
        let (id, w) = inject_input(&mut d, "kbd", key_device("kbd", 30));

        // a pipe with the read end closed makes every write fail
        let (pr, pw) = nix::unistd::pipe().unwrap();
        drop(pr);
        let fd = pw.as_raw_fd();
        d.outputs.insert("dead".to_string(), OutputSink::File(pw));
        d.roles.insert(fd, FdRole::Output);
        d.poll_fds.push(fd);
        d.current_output = Some(fd);
        d.current_output_name = "dead".to_string();
        d.grabbing = true;

        let marker = temp_path("grab-changed");
        let _ = std::fs::remove_file(&marker);
        run_line(
            &mut d,
            &format!("action set grab-changed \"exec echo x >> {}\"", marker.display()),
        );

        feed_event(&w, EV_KEY, 30, 1);
        d.read_from_device(id);

        assert_eq!(d.current_output, None);
        assert_eq!(d.current_output_name, "<none>");
        assert!(!d.grabbing);
        assert!(d.remove_queue.contains(&fd));
        assert_eq!(std::env::var("NETEVENT_GRABBING").unwrap(), "0");
        let fired = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(fired.lines().count(), 1);

        drain_queues(&mut d);
        assert!(d.outputs.is_empty());
        let _ = std::fs::remove_file(&marker);
    }

    #[test]
    fn device_removal_announces_and_clears_hotkeys() {
        let mut d = test_daemon("removal");
        let out = temp_path("removal-out");
        add_file_output(&mut d, "main", &out);
        let (id, _w) = inject_input(&mut d, "kbd", key_device("kbd", 30));
        run_line(&mut d, "hotkey add kbd KEY:30:1 nop");
        assert_eq!(d.hotkeys.len(), 1);

        run_line(&mut d, "device remove kbd");
        drain_queues(&mut d);

        assert!(d.hotkeys.is_empty());
        assert!(d.input_names.is_empty());
        assert_eq!(d.free_ids, vec![id]);
        let written = std::fs::read(&out).unwrap();
        let frame: [u8; PACKET_SIZE] = written[PACKET_SIZE..].try_into().unwrap();
        assert_eq!(
            Packet::decode(&frame).unwrap(),
            Packet::RemoveDevice { id }
        );
        let _ = std::fs::remove_file(&out);
    }

    #[test]
    fn persistent_device_removal_is_silent() {
        let mut d = test_daemon("persistent");
        let out = temp_path("persistent-out");
        add_file_output(&mut d, "main", &out);
        let (_id, _w) = inject_input(&mut d, "kbd", key_device("kbd", 30));
        run_line(&mut d, "device set-persistent kbd on");
        run_line(&mut d, "device remove kbd");
        drain_queues(&mut d);
        // hello only, no RemoveDevice frame
        assert_eq!(std::fs::read(&out).unwrap().len(), PACKET_SIZE);
        let _ = std::fs::remove_file(&out);
    }

    #[test]
    fn output_add_announces_existing_inputs() {
        let mut d = test_daemon("announce");
        let (_id, _w) = inject_input(&mut d, "kbd", key_device("kbd", 30));
        let out = temp_path("announce-out");
        add_file_output(&mut d, "main", &out);
        let written = std::fs::read(&out).unwrap();
        // hello, then one AddDevice frame + payload
        let hello: [u8; PACKET_SIZE] = written[..PACKET_SIZE].try_into().unwrap();
        assert!(matches!(
            Packet::decode(&hello).unwrap(),
            Packet::Hello { .. }
        ));
        let frame: [u8; PACKET_SIZE] =
            written[PACKET_SIZE..2 * PACKET_SIZE].try_into().unwrap();
        match Packet::decode(&frame).unwrap() {
            Packet::AddDevice(hdr) => {
                assert_eq!(hdr.id, 0);
                assert_eq!(usize::from(hdr.dev_name_size), 80);
            }
            other => panic!("wrong packet: {other:?}"),
        }
        let expected = d.input(0).unwrap().device.caps().encode_add_device(0);
        assert_eq!(&written[PACKET_SIZE..], &expected[..]);

        // --resume skips the announcements
        let out2 = temp_path("announce-out2");
        std::fs::write(&out2, b"").unwrap();
        run_line(
            &mut d,
            &format!("output add --resume second {}", out2.display()),
        );
        assert_eq!(std::fs::read(&out2).unwrap().len(), PACKET_SIZE);
        let _ = std::fs::remove_file(&out);
        let _ = std::fs::remove_file(&out2);
    }

    #[test]
    fn unknown_verbs_and_bad_hotkeys_error() {
        let mut d = test_daemon("errors");
        assert!(d.run_command_line(-1, "frobnicate").is_err());
        assert!(d.run_command_line(-1, "grab").is_err());
        assert!(d.run_command_line(-1, "grab sideways").is_err());
        assert!(d.run_command_line(-1, "use nothere").is_err());
        assert!(d.run_command_line(-1, "hotkey add nodev KEY:1:1 nop").is_err());
        let (_id, _w) = inject_input(&mut d, "kbd", key_device("kbd", 30));
        assert!(d.run_command_line(-1, "hotkey add kbd KEY:1 nop").is_err());
        assert!(d.run_command_line(-1, "hotkey add kbd NOPE:1:1 nop").is_err());
        assert!(d.run_command_line(-1, "hotkey add kbd KEY:99999999:1 nop").is_err());
        assert!(d.run_command_line(-1, "action set unknown-event nop").is_err());
        assert!(d.run_command_line(-1, "action set device-lost nop").is_ok());
    }

    #[test]
    fn hotkey_table_order_is_lexicographic() {
        let a = HotkeyDef {
            device: 0,
            ty: 1,
            code: 30,
            value: 0,
        };
        let b = HotkeyDef {
            device: 0,
            ty: 1,
            code: 30,
            value: 1,
        };
        let c = HotkeyDef {
            device: 1,
            ty: 0,
            code: 0,
            value: -5,
        };
        assert!(a < b && b < c);
    }

    #[test]
    fn ev_cnt_bounds_hotkey_match() {
        let mut d = test_daemon("evcnt");
        d.hotkeys.insert(
            HotkeyDef {
                device: 0,
                ty: EV_MAX + 1,
                code: 0,
                value: 0,
            },
            "quit".to_string(),
        );
        assert!(!d.try_hotkey(0, EV_MAX + 1, 0, 0));
        assert!(d.command_queue.is_empty());
    }
}
