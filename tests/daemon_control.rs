//! Control-protocol tests against a live daemon on a Unix socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread::JoinHandle;

use netevent::daemon::Daemon;
use netevent::proto::PACKET_SIZE;
use netevent::socket::connect_spec;

struct TestDaemon {
    spec: String,
    handle: Option<JoinHandle<()>>,
}

impl TestDaemon {
    fn start(tag: &str) -> TestDaemon {
        let spec = format!("@netevent-it-{}-{tag}", std::process::id());
        let mut daemon = Daemon::new(&spec).unwrap();
        let handle = std::thread::spawn(move || daemon.run().unwrap());
        TestDaemon {
            spec,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> (BufReader<UnixStream>, UnixStream) {
        let stream = UnixStream::from(connect_spec(&self.spec).unwrap());
        let writer = stream.try_clone().unwrap();
        (BufReader::new(stream), writer)
    }

    fn finish(mut self, reader: &mut BufReader<UnixStream>, writer: &mut UnixStream) {
        writer.write_all(b"quit\n").unwrap();
        expect_line(reader, "Ok.");
        self.handle.take().unwrap().join().unwrap();
    }
}

fn expect_line(reader: &mut BufReader<UnixStream>, want: &str) {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.trim_end_matches('\n'), want);
}

fn read_until_ok(reader: &mut BufReader<UnixStream>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        assert_ne!(reader.read_line(&mut line).unwrap(), 0, "daemon hung up");
        let line = line.trim_end_matches('\n').to_string();
        if line == "Ok." {
            return lines;
        }
        lines.push(line);
    }
}

fn temp_file(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("netevent-it-{}-{tag}", std::process::id()));
    std::fs::write(&path, b"").unwrap();
    path
}

#[test]
fn nop_and_unknown_commands() {
    let daemon = TestDaemon::start("basic");
    let (mut reader, mut writer) = daemon.connect();

    writer.write_all(b"nop\n").unwrap();
    expect_line(&mut reader, "Ok.");

    writer.write_all(b"frobnicate\n").unwrap();
    expect_line(&mut reader, "ERROR: unknown command: frobnicate");

    // a failing command aborts the rest of its line, not the daemon
    writer.write_all(b"nop; use nowhere; nop\n").unwrap();
    expect_line(&mut reader, "Ok.");
    expect_line(&mut reader, "ERROR: no such output: nowhere");
    writer.write_all(b"nop\n").unwrap();
    expect_line(&mut reader, "Ok.");

    daemon.finish(&mut reader, &mut writer);
}

#[test]
fn outputs_actions_and_env() {
    let daemon = TestDaemon::start("outputs");
    let (mut reader, mut writer) = daemon.connect();

    let out_a = temp_file("out-a");
    let out_b = temp_file("out-b");
    let marker = std::env::temp_dir().join(format!("netevent-it-{}-marker", std::process::id()));
    let _ = std::fs::remove_file(&marker);

    writer
        .write_all(format!("output add a {}\n", out_a.display()).as_bytes())
        .unwrap();
    expect_line(&mut reader, "added output a");
    expect_line(&mut reader, "Ok.");

    writer
        .write_all(format!("output add b {}\n", out_b.display()).as_bytes())
        .unwrap();
    expect_line(&mut reader, "added output b");
    expect_line(&mut reader, "Ok.");

    writer
        .write_all(
            format!(
                "action set output-changed \"exec printf %s $NETEVENT_OUTPUT_NAME > {}\"\n",
                marker.display()
            )
            .as_bytes(),
        )
        .unwrap();
    expect_line(&mut reader, "added on-'output-changed' command");
    expect_line(&mut reader, "Ok.");

    // `use` fires the action synchronously; its shell finishes before the
    // responses arrive. The action command acknowledges first.
    writer.write_all(b"use b\n").unwrap();
    expect_line(&mut reader, "Ok.");
    expect_line(&mut reader, "Ok.");
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "b");

    writer.write_all(b"info\n").unwrap();
    let info = read_until_ok(&mut reader);
    assert!(info.contains(&"Grab: off".to_string()), "{info:?}");
    assert!(info.contains(&"Outputs: 2".to_string()), "{info:?}");
    assert!(
        info.iter().any(|l| l.starts_with("Current output: ") && l.ends_with(": b")),
        "{info:?}"
    );
    assert!(
        info.iter().any(|l| l.contains("'output-changed':")),
        "{info:?}"
    );

    writer.write_all(b"output remove a\n").unwrap();
    expect_line(&mut reader, "removing output a");
    expect_line(&mut reader, "Ok.");

    daemon.finish(&mut reader, &mut writer);

    // every output received exactly the hello frame
    for path in [&out_a, &out_b] {
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(&bytes[0..2], &[0, 4]);
        assert_eq!(&bytes[4..12], b"NE2Hello");
        let _ = std::fs::remove_file(path);
    }
    let _ = std::fs::remove_file(&marker);
}

#[test]
fn source_runs_command_files() {
    let daemon = TestDaemon::start("source");
    let (mut reader, mut writer) = daemon.connect();

    let script = std::env::temp_dir().join(format!("netevent-it-{}-script", std::process::id()));
    std::fs::write(&script, "# a comment\n\n   # another\nnop\nnop\n").unwrap();

    writer
        .write_all(format!("source {}\n", script.display()).as_bytes())
        .unwrap();
    // one Ok per sourced command, then one for `source` itself
    expect_line(&mut reader, "Ok.");
    expect_line(&mut reader, "Ok.");
    expect_line(&mut reader, "Ok.");

    writer.write_all(b"source /nonexistent-netevent-file\n").unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert!(
        line.starts_with("ERROR: open(/nonexistent-netevent-file)"),
        "{line:?}"
    );

    daemon.finish(&mut reader, &mut writer);
    let _ = std::fs::remove_file(&script);
}

#[test]
fn grab_toggle_without_devices() {
    let daemon = TestDaemon::start("grab");
    let (mut reader, mut writer) = daemon.connect();

    writer.write_all(b"grab on\n").unwrap();
    expect_line(&mut reader, "Ok.");
    writer.write_all(b"info\n").unwrap();
    assert!(read_until_ok(&mut reader).contains(&"Grab: on".to_string()));

    writer.write_all(b"grab toggle\n").unwrap();
    expect_line(&mut reader, "Ok.");
    writer.write_all(b"info\n").unwrap();
    assert!(read_until_ok(&mut reader).contains(&"Grab: off".to_string()));

    writer.write_all(b"grab sideways\n").unwrap();
    expect_line(&mut reader, "ERROR: unknown grab state: sideways");

    daemon.finish(&mut reader, &mut writer);
}
