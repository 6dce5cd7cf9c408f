//! Producer-side socket transport
//!
//! Records are fire-and-forget: producers must never stall or surface an
//! error because the daemon is slow or not running. Every failure here is
//! swallowed; the only caller-visible signal is the boolean, used for debug
//! logging.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use worklens_core::ingest::WireRecord;

/// Bound on how long a producer may wait on the daemon
const SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Write one record as an NDJSON line. Returns false on any failure.
pub fn send_record(socket: &Path, record: &WireRecord) -> bool {
    let Ok(line) = serde_json::to_string(record) else {
        return false;
    };
    let Ok(stream) = UnixStream::connect(socket) else {
        return false;
    };
    if stream.set_write_timeout(Some(SEND_TIMEOUT)).is_err() {
        return false;
    }
    let mut stream = stream;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .is_ok()
}

/// Current time as fractional epoch seconds (the wire timestamp format)
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
