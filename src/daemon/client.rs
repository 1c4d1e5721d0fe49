//! Thin blocking client for the daemon socket.
//!
//! One connection, synchronous request/response with optional progress
//! streaming. Used by the test suite and by front-ends embedding the
//! daemon; no state beyond the socket itself.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{CidxError, Result};
use crate::indexer::ProgressControl;

use super::protocol::{ProgressEvent, RpcRequest, RpcResponse};

pub struct DaemonClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
}

impl DaemonClient {
    pub fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).map_err(|e| CidxError::io(socket, e))?;
        let writer = stream.try_clone().map_err(|e| CidxError::io(socket, e))?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            next_id: 0,
        })
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.writer
            .set_read_timeout(Some(timeout))
            .and_then(|_| self.writer.set_write_timeout(Some(timeout)))
            .map_err(CidxError::from)
    }

    /// Issue a request and wait for its response, ignoring progress events.
    pub fn call(&mut self, op: &str, params: Value) -> Result<Value> {
        self.call_with_progress(op, params, &mut |_| ProgressControl::Continue)
    }

    /// Issue a request, forwarding progress events to the callback. A
    /// callback returning [`ProgressControl::Interrupt`] sends a cancel
    /// message; the operation still completes with its final response.
    pub fn call_with_progress(
        &mut self,
        op: &str,
        params: Value,
        on_progress: &mut dyn FnMut(&ProgressEvent) -> ProgressControl,
    ) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;

        let request = RpcRequest {
            id,
            op: op.to_string(),
            params,
            cancel: false,
        };
        self.send(&request)?;

        let mut cancel_sent = false;
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| CidxError::Network(format!("daemon connection lost: {e}")))?;
            if read == 0 {
                return Err(CidxError::Network("daemon closed the connection".into()));
            }
            if line.trim().is_empty() {
                continue;
            }

            if let Ok(event) = serde_json::from_str::<ProgressEvent>(&line) {
                if event.event == "progress" && event.id == id {
                    if on_progress(&event) == ProgressControl::Interrupt && !cancel_sent {
                        self.send_raw(&json!({"cancel": true}))?;
                        cancel_sent = true;
                    }
                    continue;
                }
            }

            let response: RpcResponse = serde_json::from_str(&line)
                .map_err(|e| CidxError::Protocol(format!("unreadable response: {e}")))?;
            if response.id != id {
                continue;
            }
            return match (response.result, response.error) {
                (Some(result), _) => Ok(result),
                (None, Some(error)) => Err(CidxError::Protocol(format!(
                    "{}: {}",
                    error.kind, error.message
                ))),
                (None, None) => Err(CidxError::Protocol("empty response".into())),
            };
        }
    }

    fn send(&mut self, request: &RpcRequest) -> Result<()> {
        let value = serde_json::to_value(request)?;
        self.send_raw(&value)
    }

    fn send_raw(&mut self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(|e| CidxError::Network(format!("daemon connection lost: {e}")))?;
        self.writer
            .flush()
            .map_err(|e| CidxError::Network(format!("daemon connection lost: {e}")))?;
        Ok(())
    }
}
