//! Multi-connection sender
//!
//! One blocking thread per port. Every connection pulls byte sources from a
//! shared queue, streams them as `header + data`, and finishes with a
//! `DONE_CMD` handshake once the queue has run dry. A broken connection
//! hands its current source back to the queue and reconnects; a broken
//! source is abandoned and reported.

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::byte_source::ByteSource;
use crate::error::ErrorCode;
use crate::fs_enum::FileEntry;
use crate::logger::{Logger, NoopLogger};
use crate::options::Options;
use crate::progress::TransferProgress;
use crate::protocol::{encode_header, FileHeader, DONE_CMD};
use crate::queue::{DirectorySourceQueue, SourceQueue};
use crate::socket::{ClientSocket, SocketFactory, TcpSocketFactory};
use crate::stats::{SourceFailure, TransferReport, TransferStats};
use crate::throttler::{Throttle, Throttler};

/// What one connection hands back to the orchestrator.
struct ConnectionOutcome {
    stats: TransferStats,
    failed_sources: Vec<SourceFailure>,
}

impl ConnectionOutcome {
    fn failed(code: ErrorCode) -> Self {
        let mut stats = TransferStats::new();
        stats.set_error_code(code);
        Self {
            stats,
            failed_sources: Vec::new(),
        }
    }
}

pub struct Sender {
    dest_host: String,
    options: Options,
    socket_factory: Arc<dyn SocketFactory>,
    logger: Arc<dyn Logger>,
    progress: Arc<TransferProgress>,
}

impl Sender {
    pub fn new(dest_host: &str, options: Options) -> Self {
        let socket_factory = Arc::new(TcpSocketFactory::new(options.socket_config()));
        Self {
            dest_host: dest_host.to_string(),
            options,
            socket_factory,
            logger: Arc::new(NoopLogger),
            progress: Arc::new(TransferProgress::new()),
        }
    }

    pub fn with_socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = factory;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_progress(mut self, progress: Arc<TransferProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &Arc<TransferProgress> {
        &self.progress
    }

    /// Send everything under `root`. Enumeration runs in the background
    /// while the connections already drain the queue.
    pub fn start(&self, root: &Path) -> Result<TransferReport> {
        if !root.is_dir() {
            bail!("source directory {} does not exist", root.display());
        }
        let queue = Arc::new(DirectorySourceQueue::new(
            root,
            self.options.buffer_size,
            self.options.block_size_bytes(),
        ));
        let enumeration =
            queue.spawn_enumeration(self.options.file_filter(), self.options.follow_symlinks)?;
        let report = self.transfer(queue.as_ref());
        enumeration
            .join()
            .map_err(|_| anyhow!("enumeration thread panicked"))??;
        let (sources, bytes) = queue.totals();
        debug!(sources, bytes, "sources queued by enumeration");
        Ok(report)
    }

    /// Send an explicit list of files, all relative to `root`.
    pub fn start_with_files(&self, root: &Path, files: &[FileEntry]) -> TransferReport {
        let queue = DirectorySourceQueue::new(
            root,
            self.options.buffer_size,
            self.options.block_size_bytes(),
        );
        for entry in files {
            queue.add_file(entry);
        }
        queue.finish_enumeration();
        self.transfer(&queue)
    }

    /// Run one connection per configured port against `queue` and merge
    /// their results in port order.
    pub fn transfer(&self, queue: &dyn SourceQueue) -> TransferReport {
        let start = Instant::now();
        let (avg, peak, bucket) = self.options.throttler_rates();
        let throttler = Throttler::new(start, avg, peak, bucket);
        let do_throttling = throttler.is_limiting();
        let ports: Vec<u16> = self.options.ports().collect();

        info!(
            dest = %self.dest_host,
            connections = ports.len(),
            first_port = self.options.start_port,
            throttled = do_throttling,
            "starting transfer"
        );
        self.logger.start(&self.dest_host, &ports);

        let outcomes: Vec<ConnectionOutcome> = thread::scope(|s| {
            let handles: Vec<_> = ports
                .iter()
                .map(|&port| {
                    let throttler = &throttler;
                    let spawned = thread::Builder::new()
                        .name(format!("send-{port}"))
                        .spawn_scoped(s, move || {
                            self.send_one(port, queue, throttler, do_throttling)
                        });
                    (port, spawned)
                })
                .collect();
            handles
                .into_iter()
                .map(|(port, spawned)| match spawned {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        error!(port, "connection thread panicked");
                        ConnectionOutcome::failed(ErrorCode::ConnError)
                    }),
                    Err(e) => {
                        error!(port, error = %e, "cannot spawn connection thread");
                        ConnectionOutcome::failed(ErrorCode::ConnError)
                    }
                })
                .collect()
        });

        let mut workers = Vec::with_capacity(outcomes.len());
        let mut failed_sources = Vec::new();
        for outcome in outcomes {
            workers.push(outcome.stats);
            failed_sources.extend(outcome.failed_sources);
        }
        let report = TransferReport::new(workers, failed_sources, start.elapsed());

        let summary = report.summary();
        self.logger.done(
            summary.num_files(),
            summary.effective_total_bytes(),
            report.elapsed().as_secs_f64(),
        );
        info!(
            status = %report.error_code(),
            files = summary.num_files(),
            total_bytes = summary.total_bytes(),
            effective_bytes = summary.effective_total_bytes(),
            failed_attempts = summary.failed_attempts(),
            failed_sources = report.failed_sources().len(),
            mbytes_per_sec = report.throughput_mbytes_per_sec(),
            "transfer finished"
        );
        report
    }

    /// Connect, retrying transient failures up to `max_retries` attempts.
    fn connect_with_retry(&self, socket: &mut dyn ClientSocket, port: u16) -> ErrorCode {
        let attempts = self.options.max_retries.max(1);
        for attempt in 1..=attempts {
            match socket.connect() {
                Ok(()) => {
                    debug!(port, attempt, "connected");
                    return ErrorCode::Ok;
                }
                Err(ErrorCode::ConnErrorRetryable) => {
                    debug!(port, attempt, "connect failed, retrying");
                    if attempt < attempts {
                        thread::sleep(self.options.retry_delay());
                    }
                }
                Err(code) => {
                    warn!(port, error = %code, "connect failed");
                    return code;
                }
            }
        }
        warn!(port, attempts, "giving up connecting");
        ErrorCode::ConnError
    }

    /// Per-connection send loop.
    fn send_one(
        &self,
        port: u16,
        queue: &dyn SourceQueue,
        throttler: &dyn Throttle,
        do_throttling: bool,
    ) -> ConnectionOutcome {
        let mut stats = TransferStats::new();
        let mut failed_sources = Vec::new();
        let mut socket = self.socket_factory.make_socket(&self.dest_host, port);
        let mut reconnects = 0u32;

        'connection: loop {
            let code = self.connect_with_retry(socket.as_mut(), port);
            if !code.is_ok() {
                stats.set_error_code(code);
                return ConnectionOutcome {
                    stats,
                    failed_sources,
                };
            }

            while let Some(mut source) = queue.get_next_source() {
                let result = self.send_one_byte_source(
                    socket.as_mut(),
                    throttler,
                    source.as_mut(),
                    do_throttling,
                    stats.total_bytes(),
                );
                stats.add_counts(&result);
                let code = result.error_code();

                if code.is_ok() {
                    self.progress.add_file();
                    self.logger
                        .source_sent(source.identifier(), source.offset(), source.size());
                    queue.mark_consumed();
                } else if code.is_socket_error() {
                    warn!(
                        port,
                        id = source.identifier(),
                        error = %code,
                        "connection broke, returning source to queue"
                    );
                    self.logger.source_failed(source.identifier(), code, true);
                    queue.return_to_queue(source);
                    socket.close();
                    reconnects += 1;
                    if reconnects > self.options.max_retries {
                        error!(port, reconnects, "too many reconnects, stopping connection");
                        stats.set_error_code(code);
                        return ConnectionOutcome {
                            stats,
                            failed_sources,
                        };
                    }
                    continue 'connection;
                } else {
                    warn!(
                        port,
                        id = source.identifier(),
                        error = %code,
                        "source failed, skipping it"
                    );
                    self.logger.source_failed(source.identifier(), code, false);
                    failed_sources.push(SourceFailure {
                        id: source.identifier().to_string(),
                        error: code,
                    });
                    queue.mark_consumed();
                }
            }
            break;
        }

        self.finish_connection(socket.as_mut(), &mut stats, port);
        socket.close();
        ConnectionOutcome {
            stats,
            failed_sources,
        }
    }

    /// Send one source completely over an open connection.
    ///
    /// The returned stats cover only this attempt. Header and data bytes
    /// become effective only when the whole source went out.
    pub fn send_one_byte_source(
        &self,
        socket: &mut dyn ClientSocket,
        throttler: &dyn Throttle,
        source: &mut dyn ByteSource,
        do_throttling: bool,
        total_bytes: u64,
    ) -> TransferStats {
        let id = source.identifier().to_string();
        let mut stats = TransferStats::for_source(&id);
        let header =
            FileHeader::new(&id, source.offset(), source.size()).with_file_size(source.file_size());
        let header = match encode_header(&header) {
            Ok(h) => h,
            Err(e) => {
                warn!(id = %id, error = %e, "cannot encode header");
                return failed(stats, ErrorCode::ByteSourceReadError);
            }
        };

        let (written, complete) = write_fully(socket, &header);
        stats.add_header_bytes(written);
        if !complete {
            debug!(id = %id, written, "header write failed");
            return failed(stats, ErrorCode::SocketWriteError);
        }

        while !source.finished() {
            let len = match source.read() {
                Ok(len) => len,
                Err(e) => {
                    warn!(id = %id, error = %e, "read failed");
                    return failed(stats, ErrorCode::ByteSourceReadError);
                }
            };
            if source.has_error() {
                warn!(id = %id, len, "read returned data in error, dropping it");
                return failed(stats, ErrorCode::ByteSourceReadError);
            }
            if len == 0 {
                break;
            }
            let sent_so_far = total_bytes + stats.total_bytes();
            if do_throttling && sent_so_far >= self.options.throttle_after_bytes {
                throttler.limit(len as f64);
            }
            let (written, complete) = write_fully(socket, source.chunk());
            stats.add_data_bytes(written);
            self.progress.add_bytes(written);
            if !complete {
                debug!(id = %id, written, "data write failed");
                return failed(stats, ErrorCode::SocketWriteError);
            }
        }

        if source.has_error() {
            return failed(stats, ErrorCode::ByteSourceReadError);
        }
        if stats.data_bytes() != source.size() {
            warn!(
                id = %id,
                expected = source.size(),
                sent = stats.data_bytes(),
                "source ended early"
            );
            return failed(stats, ErrorCode::ByteSourceReadError);
        }

        stats.mark_effective();
        stats.incr_num_files();
        stats
    }

    /// End-of-transfer handshake. Failures are counted but never change the
    /// connection's outcome: every source was already accounted for.
    fn finish_connection(
        &self,
        socket: &mut dyn ClientSocket,
        stats: &mut TransferStats,
        port: u16,
    ) {
        let (written, complete) = write_fully(socket, &[DONE_CMD]);
        stats.add_header_bytes(written);
        if !complete {
            warn!(port, "cannot send end of transfer");
            stats.incr_handshake_failures();
            return;
        }
        stats.add_effective_bytes(written, 0);

        match read_until_close(socket) {
            Ok(()) => debug!(port, "receiver closed the connection"),
            Err(code) => {
                warn!(port, error = %code, "end of transfer not acknowledged");
                stats.incr_handshake_failures();
            }
        }
    }
}

fn failed(mut stats: TransferStats, code: ErrorCode) -> TransferStats {
    stats.set_error_code(code);
    stats.incr_failed_attempts();
    stats
}

/// Write all of `buf`, continuing after short writes. Returns the bytes the
/// socket reported as written and whether the whole buffer went out.
fn write_fully(socket: &mut dyn ClientSocket, buf: &[u8]) -> (u64, bool) {
    let mut written = 0usize;
    while written < buf.len() {
        let remaining = buf.len() - written;
        match socket.write(&buf[written..]) {
            Ok(0) => return (written as u64, false),
            Ok(n) if n > remaining => {
                // A socket claiming more than it was given is broken.
                return ((written + n) as u64, false);
            }
            Ok(n) => written += n,
            Err(e) => {
                debug!(error = %e, "socket write failed");
                return (written as u64, false);
            }
        }
    }
    (written as u64, true)
}

/// Wait for the receiver to echo `DONE_CMD` (optional) and close.
fn read_until_close(socket: &mut dyn ClientSocket) -> Result<(), ErrorCode> {
    let mut ack = [0u8; 1];
    match socket.read(&mut ack) {
        Ok(0) => return Ok(()),
        Ok(_) if ack[0] == DONE_CMD => {}
        Ok(_) => return Err(ErrorCode::ProtocolError),
        Err(e) => {
            debug!(error = %e, "handshake read failed");
            return Err(ErrorCode::SocketReadError);
        }
    }
    let mut buf = [0u8; 64];
    match socket.read(&mut buf) {
        Ok(0) => Ok(()),
        Ok(_) => Err(ErrorCode::ProtocolError),
        Err(e) => {
            debug!(error = %e, "handshake read failed");
            Err(ErrorCode::SocketReadError)
        }
    }
}
