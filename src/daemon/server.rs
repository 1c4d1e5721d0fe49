//! Connection handling and RPC dispatch.
//!
//! The accept loop hands each connection to its own thread; requests are
//! newline-delimited JSON read without buffering so that a cancel message
//! sent mid-operation is visible to the progress reporter polling the same
//! socket. Each request gets exactly one response; streaming operations
//! interleave progress events before it.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{CidxError, Result};
use crate::indexer::{ProgressControl, ProgressReporter};

use super::protocol::{
    CleanParams, FtsQueryParams, IndexParams, ProgressEvent, QueryParams, RpcRequest, RpcResponse,
    StatusParams, TemporalQueryParams, WatchParams,
};
use super::service::DaemonService;

/// Poll interval of the accept loop while checking the shutdown flag
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read timeout used while polling for client cancel messages
const CANCEL_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Run the accept loop until the service requests shutdown.
pub fn serve(listener: UnixListener, service: Arc<DaemonService>) -> Result<()> {
    listener.set_nonblocking(true).map_err(CidxError::from)?;

    loop {
        if service.shutdown_requested() {
            info!("shutdown requested, stopping accept loop");
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, service) {
                        debug!("connection ended: {e}");
                    }
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    Ok(())
}

fn handle_connection(stream: UnixStream, service: Arc<DaemonService>) -> Result<()> {
    stream.set_nonblocking(false).map_err(CidxError::from)?;
    let timeout = service.request_timeout();
    stream
        .set_read_timeout(Some(timeout))
        .map_err(CidxError::from)?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(CidxError::from)?;

    loop {
        let line = match read_line_unbuffered(&stream) {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF: client hung up
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                debug!("request timeout, closing connection");
                break;
            }
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                write_json_line(
                    &stream,
                    &RpcResponse::err(0, "protocol_error", format!("malformed request: {e}")),
                )?;
                continue;
            }
        };

        // Stray cancel for an operation that already finished
        if request.cancel {
            continue;
        }

        let response = dispatch(&service, request, &stream, timeout);
        write_json_line(&stream, &response)?;

        if service.shutdown_requested() {
            break;
        }
    }
    Ok(())
}

fn dispatch(
    service: &Arc<DaemonService>,
    request: RpcRequest,
    stream: &UnixStream,
    base_timeout: Duration,
) -> RpcResponse {
    let id = request.id;
    debug!("dispatching op={} id={id}", request.op);

    macro_rules! params {
        ($ty:ty) => {
            match serde_json::from_value::<$ty>(request.params.clone()) {
                Ok(params) => params,
                Err(e) => {
                    return RpcResponse::err(
                        id,
                        "protocol_error",
                        format!("invalid parameters for {}: {e}", request.op),
                    )
                }
            }
        };
    }

    let to_response = |id: u64, result: Result<serde_json::Value>| match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(e) => RpcResponse::err(id, e.kind(), e.to_string()),
    };

    match request.op.as_str() {
        "ping" => RpcResponse::ok(id, service.ping()),
        "get_status" => RpcResponse::ok(id, service.get_status()),
        "clear_cache" => RpcResponse::ok(id, service.clear_cache()),
        "shutdown" => RpcResponse::ok(id, service.shutdown()),
        "query" => {
            let params = params!(QueryParams);
            to_response(id, service.query(&params))
        }
        "query_fts" => {
            let params = params!(FtsQueryParams);
            to_response(id, service.query_fts(&params))
        }
        "query_hybrid" => {
            let semantic = params!(QueryParams);
            let fts = params!(FtsQueryParams);
            to_response(id, service.query_hybrid(&semantic, &fts))
        }
        "query_temporal" => {
            let params = params!(TemporalQueryParams);
            to_response(id, service.query_temporal(&params))
        }
        "index_blocking" => {
            let params = params!(IndexParams);
            let progress = WireProgress::new(stream, id, base_timeout);
            let result = service.index_blocking(&params, &progress);
            progress.finish();
            RpcResponse::ok(id, result)
        }
        "index" => {
            let params = params!(IndexParams);
            RpcResponse::ok(id, service.index(&params))
        }
        "get_index_progress" => RpcResponse::ok(id, service.get_index_progress()),
        "watch_start" => {
            let params = params!(WatchParams);
            RpcResponse::ok(id, service.watch_start(&params))
        }
        "watch_stop" => RpcResponse::ok(id, service.watch_stop()),
        "watch_status" => RpcResponse::ok(id, service.watch_status()),
        "clean" => {
            let params = params!(CleanParams);
            RpcResponse::ok(id, service.clean(&params))
        }
        "clean_data" => {
            let params = params!(CleanParams);
            RpcResponse::ok(id, service.clean_data(&params))
        }
        "status" => {
            let params = params!(StatusParams);
            RpcResponse::ok(id, service.status(&params))
        }
        "rebuild_fts_index" => {
            let params = params!(StatusParams);
            let progress = WireProgress::new(stream, id, base_timeout);
            let result = service.rebuild_fts_index(&params, &progress);
            progress.finish();
            RpcResponse::ok(id, result)
        }
        other => RpcResponse::err(id, "protocol_error", format!("unknown operation: {other}")),
    }
}

/// Read one newline-terminated line without lookahead buffering, so bytes
/// meant for a later read (client cancel messages) stay on the socket.
fn read_line_unbuffered(mut stream: &UnixStream) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                return if line.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(String::from_utf8_lossy(&line).to_string()))
                };
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    return Ok(Some(String::from_utf8_lossy(&line).to_string()));
                }
                line.push(byte[0]);
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn write_json_line<T: serde::Serialize>(
    mut stream: &UnixStream,
    value: &T,
) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stream.write_all(&line).map_err(CidxError::from)?;
    stream.flush().map_err(CidxError::from)?;
    Ok(())
}

/// Progress reporter streaming events to the client and polling the same
/// socket for cancel messages. Concurrent-files data is serialised to a
/// JSON string server-side; nothing structured leaks across the boundary.
pub struct WireProgress {
    stream: Mutex<UnixStream>,
    request_id: u64,
    correlation: AtomicU64,
    interrupted: AtomicBool,
    base_timeout: Duration,
}

impl WireProgress {
    fn new(stream: &UnixStream, request_id: u64, base_timeout: Duration) -> Self {
        let clone = stream.try_clone().expect("socket clone failed");
        Self {
            stream: Mutex::new(clone),
            request_id,
            correlation: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            base_timeout,
        }
    }

    /// Restore the connection's normal read timeout after the streaming
    /// operation ends.
    fn finish(&self) {
        let stream = self.stream.lock().expect("progress stream poisoned");
        let _ = stream.set_read_timeout(Some(self.base_timeout));
    }

    /// Non-blocking check for a client cancel message.
    fn poll_cancel(&self, stream: &UnixStream) -> bool {
        if self.interrupted.load(Ordering::SeqCst) {
            return true;
        }
        if stream.set_read_timeout(Some(CANCEL_POLL_TIMEOUT)).is_err() {
            return false;
        }
        let cancelled = match read_line_unbuffered(stream) {
            Ok(Some(line)) => serde_json::from_str::<RpcRequest>(&line)
                .map(|r| r.cancel)
                .unwrap_or(false),
            Ok(None) => true, // client hung up: treat as cancellation
            Err(_) => false,
        };
        if cancelled {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        cancelled
    }

    fn emit(&self, current: usize, total: usize, file_path: &Path, info: &str) -> ProgressControl {
        let stream = self.stream.lock().expect("progress stream poisoned");
        if self.poll_cancel(&stream) {
            return ProgressControl::Interrupt;
        }

        let event = ProgressEvent {
            id: self.request_id,
            event: "progress".to_string(),
            current,
            total,
            file_path: file_path.display().to_string(),
            info: info.to_string(),
            concurrent_files_json: json!([]).to_string(),
            correlation_id: self.correlation.fetch_add(1, Ordering::SeqCst) + 1,
        };

        if write_json_line(&stream, &event).is_err() {
            // Dead client: stop the operation gracefully
            return ProgressControl::Interrupt;
        }
        ProgressControl::Continue
    }
}

impl ProgressReporter for WireProgress {
    fn on_progress(
        &self,
        current: usize,
        total: usize,
        file_path: &Path,
        info: &str,
    ) -> ProgressControl {
        self.emit(current, total, file_path, info)
    }
}

/// Socket path for a project's config directory.
pub fn socket_path(config_dir: &Path) -> std::path::PathBuf {
    config_dir.join(crate::constants::SOCKET_FILE_NAME)
}

/// Bind the daemon socket, treating the bind as the single-instance lock.
///
/// A pre-existing socket file is probed with a connect: success means a
/// live daemon owns the project and this process must exit; refusal or
/// not-found means the socket is stale and is unlinked before binding.
pub fn claim_socket(socket: &Path) -> Result<UnixListener> {
    if socket.exists() {
        match UnixStream::connect(socket) {
            Ok(_) => {
                return Err(CidxError::SingleInstanceViolation {
                    socket: socket.to_path_buf(),
                });
            }
            Err(e)
                if e.kind() == ErrorKind::ConnectionRefused
                    || e.kind() == ErrorKind::NotFound =>
            {
                info!("removing stale socket {}", socket.display());
                let _ = std::fs::remove_file(socket);
            }
            Err(e) => return Err(CidxError::io(socket, e)),
        }
    }

    UnixListener::bind(socket).map_err(|e| {
        if e.kind() == ErrorKind::AddrInUse {
            CidxError::SingleInstanceViolation {
                socket: socket.to_path_buf(),
            }
        } else {
            CidxError::io(socket, e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_claim_socket_is_exclusive() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");

        let _listener = claim_socket(&socket).unwrap();
        let err = claim_socket(&socket).unwrap_err();
        assert_eq!(err.kind(), "single_instance_violation");
    }

    #[test]
    fn test_claim_socket_removes_stale_file() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");

        // A bound-then-dropped listener leaves a stale socket file behind
        {
            let _listener = UnixListener::bind(&socket).unwrap();
        }
        assert!(socket.exists());

        let _listener = claim_socket(&socket).unwrap();
    }
}
