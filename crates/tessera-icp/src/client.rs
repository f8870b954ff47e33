//! Threaded ICP client used by the RDP server.
//!
//! One blocking reader thread owns the receive half of the pipe and
//! routes frames: responses complete the matching waiter, requests from
//! the session manager are handed to the registered handler (which posts
//! them to the right connection runloop and answers later with
//! [`IcpClient::send_response`]).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::header::{IcpHeader, IcpStatus, HEADER_LEN};
use crate::msgs::{self, VersionInfo};
use crate::{decode_payload, encode_payload, IcpError, CALL_TIMEOUT_SECS};

/// A request initiated by the session manager.
#[derive(Debug)]
pub struct ServerCall {
    pub tag: u32,
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

type CallbackFn = Box<dyn FnOnce(Result<(IcpStatus, Vec<u8>), IcpError>) + Send>;

enum Pending {
    Sync(mpsc::SyncSender<(IcpStatus, Vec<u8>)>),
    Callback(CallbackFn),
}

struct Shared {
    writer: Mutex<UnixStream>,
    pending: Mutex<HashMap<u32, Pending>>,
    next_tag: AtomicU32,
    alive: AtomicBool,
    peer_version: Mutex<Option<VersionInfo>>,
    server_calls: Mutex<Option<Box<dyn Fn(ServerCall) + Send + Sync>>>,
    disconnect_cb: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

#[derive(Clone)]
pub struct IcpClient {
    shared: Arc<Shared>,
}

impl IcpClient {
    /// Connect to the session manager's ICP endpoint.
    pub fn connect(timeout: Duration) -> Result<IcpClient, IcpError> {
        let stream = tessera_wire::pipe::connect(crate::ICP_ENDPOINT, timeout)?;
        Self::from_stream(stream)
    }

    /// Connect to an explicit socket path (tests, non-standard setups).
    pub fn connect_path(path: &Path) -> Result<IcpClient, IcpError> {
        let stream = UnixStream::connect(path)?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: UnixStream) -> Result<IcpClient, IcpError> {
        stream.set_nonblocking(false)?;
        let reader = stream.try_clone()?;
        let shared = Arc::new(Shared {
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            next_tag: AtomicU32::new(1),
            alive: AtomicBool::new(true),
            peer_version: Mutex::new(None),
            server_calls: Mutex::new(None),
            disconnect_cb: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("icp-reader".into())
            .spawn(move || reader_loop(reader, &thread_shared))?;

        Ok(IcpClient { shared })
    }

    /// Install the handler for requests originating at the session
    /// manager (SwitchTo, LogoffUserSession, OTS API, …).
    pub fn set_server_call_handler(&self, handler: impl Fn(ServerCall) + Send + Sync + 'static) {
        *self.shared.server_calls.lock().expect("icp handler lock") = Some(Box::new(handler));
    }

    /// Install a callback run when the session manager connection dies.
    pub fn set_disconnect_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.shared.disconnect_cb.lock().expect("icp handler lock") = Some(Box::new(handler));
    }

    fn next_tag(&self) -> u32 {
        loop {
            let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
            if tag != 0 {
                return tag;
            }
        }
    }

    fn write_frame(&self, header: IcpHeader, payload: &[u8]) -> Result<(), IcpError> {
        if !self.shared.alive.load(Ordering::Acquire) {
            return Err(IcpError::Disconnected);
        }
        let mut writer = self.shared.writer.lock().expect("icp writer lock");
        writer.write_all(&header.encode())?;
        writer.write_all(payload)?;
        Ok(())
    }

    /// Raw synchronous call with the standard 15 s budget.
    pub fn call_raw(&self, msg_type: u32, payload: &[u8]) -> Result<(IcpStatus, Vec<u8>), IcpError> {
        let tag = self.next_tag();
        let (tx, rx) = mpsc::sync_channel(1);
        self.shared
            .pending
            .lock()
            .expect("icp pending lock")
            .insert(tag, Pending::Sync(tx));

        if let Err(e) = self.write_frame(
            IcpHeader::request(tag, msg_type, payload.len() as u32),
            payload,
        ) {
            self.shared.pending.lock().expect("icp pending lock").remove(&tag);
            return Err(e);
        }

        match rx.recv_timeout(Duration::from_secs(CALL_TIMEOUT_SECS)) {
            Ok(result) => Ok(result),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.shared.pending.lock().expect("icp pending lock").remove(&tag);
                Err(IcpError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(IcpError::Disconnected),
        }
    }

    /// Raw asynchronous call; the callback runs on the reader thread.
    pub fn call_raw_async(
        &self,
        msg_type: u32,
        payload: &[u8],
        callback: impl FnOnce(Result<(IcpStatus, Vec<u8>), IcpError>) + Send + 'static,
    ) -> Result<(), IcpError> {
        let tag = self.next_tag();
        self.shared
            .pending
            .lock()
            .expect("icp pending lock")
            .insert(tag, Pending::Callback(Box::new(callback)));
        if let Err(e) = self.write_frame(
            IcpHeader::request(tag, msg_type, payload.len() as u32),
            payload,
        ) {
            if let Some(Pending::Callback(cb)) = self
                .shared
                .pending
                .lock()
                .expect("icp pending lock")
                .remove(&tag)
            {
                cb(Err(IcpError::Disconnected));
            }
            return Err(e);
        }
        Ok(())
    }

    fn call<Req: serde::Serialize, Reply: serde::de::DeserializeOwned>(
        &self,
        msg_type: u32,
        kind: &'static str,
        request: &Req,
    ) -> Result<Reply, IcpError> {
        let payload = encode_payload(kind, request)?;
        let (status, body) = self.call_raw(msg_type, &payload)?;
        if status != IcpStatus::Success {
            return Err(IcpError::Status(status));
        }
        decode_payload(kind, &body)
    }

    /// Answer a session-manager-initiated request.
    pub fn send_response(
        &self,
        tag: u32,
        msg_type: u32,
        status: IcpStatus,
        payload: &[u8],
    ) -> Result<(), IcpError> {
        self.write_frame(
            IcpHeader::response(tag, msg_type, status, payload.len() as u32),
            payload,
        )
    }

    pub fn send_response_json<T: serde::Serialize>(
        &self,
        tag: u32,
        msg_type: u32,
        status: IcpStatus,
        body: &T,
    ) -> Result<(), IcpError> {
        let payload = encode_payload("response", body)?;
        self.send_response(tag, msg_type, status, &payload)
    }

    /// Exchange protocol versions; must be the first call.
    pub fn announce(&self) -> Result<VersionInfo, IcpError> {
        let ours = VersionInfo {
            version_major: crate::ICP_VERSION_MAJOR,
            version_minor: crate::ICP_VERSION_MINOR,
        };
        let theirs: VersionInfo = self.call(msgs::MSG_VERSION_INFO, "VersionInfo", &ours)?;
        *self.shared.peer_version.lock().expect("icp version lock") = Some(theirs);
        Ok(theirs)
    }

    /// Whether the peer understands `PropertyBulk` (protocol ≥ 1.1).
    #[must_use]
    pub fn peer_supports_bulk(&self) -> bool {
        match *self.shared.peer_version.lock().expect("icp version lock") {
            Some(v) => v.version_major > 1 || (v.version_major == 1 && v.version_minor >= 1),
            None => false,
        }
    }

    pub fn ping(&self) -> Result<bool, IcpError> {
        let reply: msgs::PingReply = self.call(msgs::MSG_PING, "Ping", &())?;
        Ok(reply.pong)
    }

    pub fn logon_user(&self, request: &msgs::LogonUser) -> Result<msgs::LogonUserReply, IcpError> {
        self.call(msgs::MSG_LOGON_USER, "LogonUser", request)
    }

    pub fn disconnect_user_session(&self, connection_id: u32) -> Result<bool, IcpError> {
        let reply: msgs::DisconnectUserSessionReply = self.call(
            msgs::MSG_DISCONNECT_USER_SESSION,
            "DisconnectUserSession",
            &msgs::DisconnectUserSession { connection_id },
        )?;
        Ok(reply.disconnected)
    }

    /// Fire-and-forget variant used on the connection teardown path.
    pub fn disconnect_user_session_async(&self, connection_id: u32) {
        let payload = match encode_payload(
            "DisconnectUserSession",
            &msgs::DisconnectUserSession { connection_id },
        ) {
            Ok(p) => p,
            Err(_) => return,
        };
        let _ = self.call_raw_async(msgs::MSG_DISCONNECT_USER_SESSION, &payload, |_| {});
    }

    pub fn property_bool(&self, connection_id: u32, path: &str) -> Result<Option<bool>, IcpError> {
        let reply: msgs::PropertyBoolReply = self.call(
            msgs::MSG_PROPERTY_BOOL,
            "PropertyBool",
            &msgs::PropertyGet {
                connection_id,
                path: path.into(),
            },
        )?;
        Ok(reply.success.then_some(reply.value))
    }

    pub fn property_number(&self, connection_id: u32, path: &str) -> Result<Option<i64>, IcpError> {
        let reply: msgs::PropertyNumberReply = self.call(
            msgs::MSG_PROPERTY_NUMBER,
            "PropertyNumber",
            &msgs::PropertyGet {
                connection_id,
                path: path.into(),
            },
        )?;
        Ok(reply.success.then_some(reply.value))
    }

    pub fn property_string(
        &self,
        connection_id: u32,
        path: &str,
    ) -> Result<Option<String>, IcpError> {
        let reply: msgs::PropertyStringReply = self.call(
            msgs::MSG_PROPERTY_STRING,
            "PropertyString",
            &msgs::PropertyGet {
                connection_id,
                path: path.into(),
            },
        )?;
        Ok(reply.success.then_some(reply.value))
    }

    /// Batch N property queries into one RPC; falls back to sequential
    /// calls when the peer predates protocol 1.1.
    pub fn property_bulk(
        &self,
        connection_id: u32,
        requests: &[msgs::PropertyBulkRequest],
    ) -> Result<Vec<msgs::PropertyBulkValue>, IcpError> {
        if self.peer_supports_bulk() {
            let reply: msgs::PropertyBulkReply = self.call(
                msgs::MSG_PROPERTY_BULK,
                "PropertyBulk",
                &msgs::PropertyBulk {
                    connection_id,
                    requests: requests.to_vec(),
                },
            )?;
            return Ok(reply.results);
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let value = match request.kind {
                msgs::PropertyKind::Bool => self
                    .property_bool(connection_id, &request.path)?
                    .map_or(msgs::PropertyBulkValue::Missing, msgs::PropertyBulkValue::Bool),
                msgs::PropertyKind::Number => self
                    .property_number(connection_id, &request.path)?
                    .map_or(msgs::PropertyBulkValue::Missing, msgs::PropertyBulkValue::Number),
                msgs::PropertyKind::String => self
                    .property_string(connection_id, &request.path)?
                    .map_or(msgs::PropertyBulkValue::Missing, msgs::PropertyBulkValue::String),
            };
            results.push(value);
        }
        Ok(results)
    }

    pub fn remote_control_ended(&self, spy_id: u32, spied_id: u32) -> Result<(), IcpError> {
        let _: msgs::GenericReply = self.call(
            msgs::MSG_REMOTE_CONTROL_ENDED,
            "RemoteControlEnded",
            &msgs::RemoteControlEnded { spy_id, spied_id },
        )?;
        Ok(())
    }
}

fn reader_loop(mut stream: UnixStream, shared: &Arc<Shared>) {
    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header_buf).is_err() {
            break;
        }
        let header = IcpHeader::decode(&header_buf);
        let mut payload = vec![0u8; header.length as usize];
        if stream.read_exact(&mut payload).is_err() {
            break;
        }

        if header.is_response {
            let pending = shared
                .pending
                .lock()
                .expect("icp pending lock")
                .remove(&header.tag);
            match pending {
                Some(Pending::Sync(tx)) => {
                    let _ = tx.send((header.status, payload));
                }
                Some(Pending::Callback(cb)) => cb(Ok((header.status, payload))),
                None => {
                    tracing::debug!(tag = header.tag, "response for an aborted call, dropping");
                }
            }
        } else {
            let handler = shared.server_calls.lock().expect("icp handler lock");
            if let Some(handler) = handler.as_ref() {
                handler(ServerCall {
                    tag: header.tag,
                    msg_type: header.msg_type,
                    payload,
                });
            } else {
                tracing::warn!(
                    msg_type = header.msg_type,
                    "server call arrived before a handler was installed"
                );
            }
        }
    }

    shared.alive.store(false, Ordering::Release);

    // Fail everything still in flight.
    let pending: Vec<Pending> = shared
        .pending
        .lock()
        .expect("icp pending lock")
        .drain()
        .map(|(_, p)| p)
        .collect();
    for entry in pending {
        match entry {
            Pending::Sync(tx) => drop(tx),
            Pending::Callback(cb) => cb(Err(IcpError::Disconnected)),
        }
    }

    if let Some(cb) = shared.disconnect_cb.lock().expect("icp handler lock").as_ref() {
        cb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn spawn_fake_manager(listener: UnixListener, mut serve: impl FnMut(&mut UnixStream) + Send + 'static) {
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            serve(&mut stream);
        });
    }

    fn read_frame(stream: &mut UnixStream) -> (IcpHeader, Vec<u8>) {
        let mut header_buf = [0u8; HEADER_LEN];
        stream.read_exact(&mut header_buf).unwrap();
        let header = IcpHeader::decode(&header_buf);
        let mut payload = vec![0u8; header.length as usize];
        stream.read_exact(&mut payload).unwrap();
        (header, payload)
    }

    fn write_frame(stream: &mut UnixStream, header: IcpHeader, payload: &[u8]) {
        stream.write_all(&header.encode()).unwrap();
        stream.write_all(payload).unwrap();
    }

    #[test]
    fn sync_call_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icp");
        let listener = UnixListener::bind(&path).unwrap();

        spawn_fake_manager(listener, |stream| {
            let (header, _payload) = read_frame(stream);
            assert_eq!(header.msg_type, msgs::MSG_PING);
            assert!(!header.is_response);
            let body = serde_json::to_vec(&msgs::PingReply { pong: true }).unwrap();
            write_frame(
                stream,
                IcpHeader::response(header.tag, header.msg_type, IcpStatus::Success, body.len() as u32),
                &body,
            );
        });

        let client = IcpClient::connect_path(&path).unwrap();
        assert!(client.ping().unwrap());
    }

    #[test]
    fn failed_status_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icp");
        let listener = UnixListener::bind(&path).unwrap();

        spawn_fake_manager(listener, |stream| {
            let (header, _) = read_frame(stream);
            write_frame(
                stream,
                IcpHeader::response(header.tag, header.msg_type, IcpStatus::NotFound, 0),
                &[],
            );
        });

        let client = IcpClient::connect_path(&path).unwrap();
        let err = client.ping().unwrap_err();
        assert!(matches!(err, IcpError::Status(IcpStatus::NotFound)));
    }

    #[test]
    fn server_call_reaches_handler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icp");
        let listener = UnixListener::bind(&path).unwrap();
        let (got_tx, got_rx) = mpsc::channel();

        spawn_fake_manager(listener, move |stream| {
            let body =
                serde_json::to_vec(&msgs::LogoffUserSession { connection_id: 9 }).unwrap();
            write_frame(
                stream,
                IcpHeader::request(77, msgs::MSG_LOGOFF_USER_SESSION, body.len() as u32),
                &body,
            );
            // Keep the socket open until the handler has run.
            let (header, _) = read_frame(stream);
            assert!(header.is_response);
            assert_eq!(header.tag, 77);
        });

        let client = IcpClient::connect_path(&path).unwrap();
        let responder = client.clone();
        client.set_server_call_handler(move |call| {
            got_tx.send(call.msg_type).unwrap();
            responder
                .send_response_json(call.tag, call.msg_type, IcpStatus::Success, &msgs::GenericReply { success: true })
                .unwrap();
        });

        let msg_type = got_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg_type, msgs::MSG_LOGOFF_USER_SESSION);
    }

    #[test]
    fn disconnect_fails_pending_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icp");
        let listener = UnixListener::bind(&path).unwrap();

        spawn_fake_manager(listener, |stream| {
            let _ = read_frame(stream);
            // Close without answering.
        });

        let client = IcpClient::connect_path(&path).unwrap();
        let err = client.ping().unwrap_err();
        assert!(matches!(err, IcpError::Disconnected | IcpError::Timeout));
    }
}
