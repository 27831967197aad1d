//! Receiving side of the protocol
//!
//! Listens on a range of ports, one thread each. A connection carries any
//! number of `header + data` records and ends with `DONE_CMD`, which is
//! echoed back before the connection is closed. A port is finished once it
//! saw `DONE_CMD`; connections that drop earlier are expected to come back
//! (the sender reconnects and resends the interrupted source).

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::options::Options;
use crate::protocol::{normalize_under_root, read_header_body, FileHeader, DONE_CMD, FILE_CMD};

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_BUFFER: usize = 256 * 1024;

/// Totals for one receive session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    pub files: u64,
    pub bytes: u64,
    pub connections: u64,
    /// Connections that ended with a protocol or I/O error
    pub failed_connections: u64,
    /// Ports that gave up waiting for a sender
    pub idle_ports: u64,
}

impl ReceiveReport {
    fn merge(&mut self, other: &ReceiveReport) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.connections += other.connections;
        self.failed_connections += other.failed_connections;
        self.idle_ports += other.idle_ports;
    }
}

pub struct Receiver {
    root: PathBuf,
    listeners: Vec<(u16, TcpListener)>,
    read_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl Receiver {
    /// Bind `num_ports` listeners starting at `start_port`. With
    /// `start_port == 0` every listener gets its own ephemeral port.
    pub fn bind(host: &str, options: &Options, root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("creating destination {}", root.display()))?;
        let mut listeners = Vec::with_capacity(options.num_ports as usize);
        for i in 0..options.num_ports {
            let want = if options.start_port == 0 {
                0
            } else {
                options.start_port.wrapping_add(i)
            };
            let listener = TcpListener::bind((host, want))
                .with_context(|| format!("bind {host}:{want}"))?;
            listener.set_nonblocking(true)?;
            let port = listener.local_addr()?.port();
            listeners.push((port, listener));
        }
        Ok(Self {
            root: root.to_path_buf(),
            listeners,
            read_timeout: (options.write_timeout_millis > 0)
                .then(|| Duration::from_millis(options.write_timeout_millis)),
            idle_timeout: options.idle_timeout(),
        })
    }

    /// Stop waiting on a port after this long without any connection.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|(p, _)| *p).collect()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve one transfer: returns once every port saw `DONE_CMD` (or went
    /// idle).
    pub fn receive(&self) -> Result<ReceiveReport> {
        info!(ports = ?self.ports(), root = %self.root.display(), "waiting for sender");
        let results: Vec<Result<ReceiveReport>> = thread::scope(|s| {
            let handles: Vec<_> = self
                .listeners
                .iter()
                .map(|(port, listener)| {
                    thread::Builder::new()
                        .name(format!("recv-{port}"))
                        .spawn_scoped(s, move || self.serve_port(*port, listener))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h {
                    Ok(h) => h
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("receiver thread panicked"))),
                    Err(e) => Err(e).context("spawning receiver thread"),
                })
                .collect()
        });

        let mut report = ReceiveReport::default();
        for r in results {
            report.merge(&r?);
        }
        info!(
            files = report.files,
            bytes = report.bytes,
            connections = report.connections,
            failed = report.failed_connections,
            "receive finished"
        );
        Ok(report)
    }

    /// Serve transfers back to back until the process is stopped.
    pub fn run_daemon(&self) -> Result<()> {
        loop {
            self.receive()?;
        }
    }

    fn serve_port(&self, port: u16, listener: &TcpListener) -> Result<ReceiveReport> {
        let mut report = ReceiveReport::default();
        let mut idle_since = Instant::now();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(port, %peer, "connection accepted");
                    report.connections += 1;
                    match self.handle_connection(stream, &mut report) {
                        Ok(true) => return Ok(report),
                        Ok(false) => {
                            warn!(port, %peer, "sender left before end of transfer");
                        }
                        Err(e) => {
                            warn!(port, %peer, error = %format!("{e:#}"), "connection failed");
                            report.failed_connections += 1;
                        }
                    }
                    idle_since = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(limit) = self.idle_timeout {
                        if idle_since.elapsed() >= limit {
                            warn!(port, "no sender, giving up on port");
                            report.idle_ports += 1;
                            return Ok(report);
                        }
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).with_context(|| format!("accept on port {port}")),
            }
        }
    }

    /// Returns `Ok(true)` once the sender finished with `DONE_CMD`.
    fn handle_connection(&self, stream: TcpStream, report: &mut ReceiveReport) -> Result<bool> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(self.read_timeout)?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::with_capacity(READ_BUFFER, stream);

        loop {
            let mut cmd = [0u8; 1];
            if read_cmd(&mut reader, &mut cmd)? == 0 {
                return Ok(false);
            }
            match cmd[0] {
                FILE_CMD => {
                    let header = read_header_body(&mut reader)?;
                    self.receive_file(&mut reader, &header)?;
                    report.files += 1;
                    report.bytes += header.size;
                }
                DONE_CMD => {
                    writer.write_all(&[DONE_CMD])?;
                    writer.shutdown(Shutdown::Both).ok();
                    return Ok(true);
                }
                other => bail!("unexpected command byte {other:#04x}"),
            }
        }
    }

    fn receive_file<R: Read>(&self, reader: &mut R, header: &FileHeader) -> Result<()> {
        let path = normalize_under_root(&self.root, &header.id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // Blocks of one file may arrive on different connections: size the
        // file instead of truncating it, so other blocks survive.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.set_len(header.file_size)
            .with_context(|| format!("sizing {}", path.display()))?;
        file.seek(SeekFrom::Start(header.offset))?;
        let copied = io::copy(&mut reader.by_ref().take(header.size), &mut file)
            .with_context(|| format!("receiving {}", header.id))?;
        if copied != header.size {
            bail!(
                "{} truncated: got {} of {} bytes",
                header.id,
                copied,
                header.size
            );
        }
        debug!(id = %header.id, offset = header.offset, size = header.size, "received");
        Ok(())
    }
}

fn read_cmd<R: Read>(reader: &mut R, cmd: &mut [u8; 1]) -> io::Result<usize> {
    loop {
        match reader.read(cmd) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_header;

    fn options() -> Options {
        Options {
            num_ports: 1,
            start_port: 0,
            ..Options::default()
        }
    }

    fn record(id: &str, offset: u64, data: &[u8]) -> Vec<u8> {
        block(id, offset, data, offset + data.len() as u64)
    }

    fn block(id: &str, offset: u64, data: &[u8], file_size: u64) -> Vec<u8> {
        let header = FileHeader::new(id, offset, data.len() as u64).with_file_size(file_size);
        let mut buf = encode_header(&header).unwrap();
        buf.extend_from_slice(data);
        buf
    }

    /// Send `payload`, then read whatever the receiver answers until it
    /// closes.
    fn exchange(port: u16, payload: &[u8]) -> Vec<u8> {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        conn.write_all(payload).unwrap();
        let mut answer = Vec::new();
        let _ = conn.read_to_end(&mut answer);
        answer
    }

    #[test]
    fn writes_files_and_echoes_done() {
        let dir = tempfile::tempdir().unwrap();
        let rx = Receiver::bind("127.0.0.1", &options(), dir.path()).unwrap();
        let port = rx.ports()[0];

        let client = thread::spawn(move || {
            let mut payload = record("a.txt", 0, b"hello");
            payload.extend(record("sub/b.bin", 0, &[7u8; 1000]));
            payload.push(DONE_CMD);
            exchange(port, &payload)
        });
        let report = rx.receive().unwrap();
        assert_eq!(client.join().unwrap(), vec![DONE_CMD]);

        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 1005);
        assert_eq!(report.connections, 1);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dir.path().join("sub/b.bin")).unwrap(), vec![7u8; 1000]);
    }

    #[test]
    fn blocks_land_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let rx = Receiver::bind("127.0.0.1", &options(), dir.path()).unwrap();
        let port = rx.ports()[0];

        let client = thread::spawn(move || {
            let mut payload = record("big", 4, b"efgh");
            payload.extend(block("big", 0, b"abcd", 8));
            payload.push(DONE_CMD);
            exchange(port, &payload)
        });
        rx.receive().unwrap();
        client.join().unwrap();
        assert_eq!(fs::read(dir.path().join("big")).unwrap(), b"abcdefgh");
    }

    #[test]
    fn stale_longer_file_is_cut_to_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old"), b"0123456789").unwrap();
        fs::write(dir.path().join("blocks"), vec![b'z'; 20]).unwrap();
        let rx = Receiver::bind("127.0.0.1", &options(), dir.path()).unwrap();
        let port = rx.ports()[0];

        let client = thread::spawn(move || {
            let mut payload = record("old", 0, b"abcde");
            payload.extend(block("blocks", 3, b"def", 6));
            payload.extend(block("blocks", 0, b"abc", 6));
            payload.push(DONE_CMD);
            exchange(port, &payload)
        });
        rx.receive().unwrap();
        client.join().unwrap();
        assert_eq!(fs::read(dir.path().join("old")).unwrap(), b"abcde");
        assert_eq!(fs::read(dir.path().join("blocks")).unwrap(), b"abcdef");
    }

    #[test]
    fn idle_timeout_comes_from_options() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options {
            idle_timeout_millis: 100,
            ..options()
        };
        let rx = Receiver::bind("127.0.0.1", &opts, dir.path()).unwrap();
        let report = rx.receive().unwrap();
        assert_eq!(report.idle_ports, 1);
    }

    #[test]
    fn traversal_drops_connection_and_waits_for_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("in");
        let rx = Receiver::bind("127.0.0.1", &options(), &root).unwrap();
        let port = rx.ports()[0];

        let client = thread::spawn(move || {
            let first = exchange(port, &record("../escape", 0, b"x"));
            let second = exchange(port, &[DONE_CMD]);
            (first, second)
        });
        let report = rx.receive().unwrap();
        let (first, second) = client.join().unwrap();
        assert!(first.is_empty());
        assert_eq!(second, vec![DONE_CMD]);
        assert_eq!(report.failed_connections, 1);
        assert_eq!(report.connections, 2);
        assert_eq!(report.files, 0);
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn unknown_command_fails_connection() {
        let dir = tempfile::tempdir().unwrap();
        let rx = Receiver::bind("127.0.0.1", &options(), dir.path())
            .unwrap()
            .with_idle_timeout(Duration::from_millis(300));
        let port = rx.ports()[0];
        let client = thread::spawn(move || exchange(port, &[0x99]));
        let report = rx.receive().unwrap();
        client.join().unwrap();
        assert_eq!(report.failed_connections, 1);
        assert_eq!(report.idle_ports, 1);
    }

    #[test]
    fn idle_port_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options {
            num_ports: 3,
            ..options()
        };
        let rx = Receiver::bind("127.0.0.1", &opts, dir.path())
            .unwrap()
            .with_idle_timeout(Duration::from_millis(100));
        let ports = rx.ports();
        assert_eq!(ports.len(), 3);
        assert!(ports.iter().all(|p| *p != 0));
        let report = rx.receive().unwrap();
        assert_eq!(report.idle_ports, 3);
        assert_eq!(report.connections, 0);
    }
}
