//! The link to a session's graphical backend: a framed message stream
//! over a named pipe, with the version/cookie gate, stateful redelivery
//! data and the SBP / user-message reply tables.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tessera_icp::msgs::BackendProps;
use tessera_wire::dmgbuf::DamageBuffer;
use tessera_wire::msg::{self, MessageHeader, WireMessage, HEADER_LEN};
use tessera_wire::ring::RingBuffer;
use tessera_wire::{pipe, WireError, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};

/// Initial transmit ring size and the hard growth ceiling.
const XMIT_INITIAL: usize = 0x10000;
const XMIT_CEILING: usize = 16 * 1024 * 1024;

/// How long to keep retrying the backend pipe at attach time.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend speaks protocol {major}.{minor}, expected {expected}.x")]
    VersionMismatch {
        major: u32,
        minor: u32,
        expected: u32,
    },
    #[error("backend cookie does not match")]
    CookieMismatch,
    #[error("backend sent {0} before the version exchange")]
    EarlyMessage(&'static str),
    #[error("backend closed the pipe")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    pub scanline: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_pixel: u32,
}

#[derive(Clone, Copy)]
enum RxState {
    WaitingHeader,
    WaitingPayload(MessageHeader),
}

pub struct BackendLink {
    stream: UnixStream,
    write_ready: bool,
    xmit: RingBuffer,
    rx_state: RxState,
    rx_buf: Vec<u8>,
    rx_filled: usize,

    pub props: BackendProps,
    pub version_exchanged: bool,
    pub backend_version: u32,
    pub multiseat_capable: bool,
    pub waiting_sync_reply: bool,
    /// An inactive link (shadowing source) keeps the pipe open but
    /// drops stateful updates.
    pub active: bool,

    pub screen: ScreenInfo,
    pub damage: Option<DamageBuffer>,

    pub last_system_pointer: u32,
    pub have_backend_pointer: bool,
    pub last_set_pointer: Option<msg::SetPointer>,
    pub last_seat_new: Option<msg::SeatNew>,

    message_answers: HashMap<u32, (u32, u32)>,
    next_message_id: u32,
}

impl BackendLink {
    /// Connect the pipe and send the Version message with our cookie.
    pub fn connect(props: BackendProps) -> Result<BackendLink, BackendError> {
        let stream = pipe::connect(&props.service_endpoint, CONNECT_TIMEOUT)?;
        tracing::debug!(endpoint = %props.service_endpoint, "connected to backend endpoint");

        let mut link = BackendLink {
            stream,
            write_ready: true,
            xmit: RingBuffer::new(XMIT_INITIAL, XMIT_CEILING),
            rx_state: RxState::WaitingHeader,
            rx_buf: vec![0; 0x10000],
            rx_filled: 0,
            props,
            version_exchanged: false,
            backend_version: 0,
            multiseat_capable: false,
            waiting_sync_reply: false,
            active: true,
            screen: ScreenInfo::default(),
            damage: None,
            last_system_pointer: msg::SYSPTR_DEFAULT,
            have_backend_pointer: false,
            last_set_pointer: None,
            last_seat_new: None,
            message_answers: HashMap::new(),
            next_message_id: 1,
        };

        link.send(&WireMessage::Version(msg::Version {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            cookie: link.props.server_cookie.clone(),
        }))?;
        Ok(link)
    }

    #[must_use]
    pub fn pipe_fd(&self) -> RawFd {
        self.stream.as_fd().as_raw_fd()
    }

    /// Whether the pipe event source must also watch for writability.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        !self.write_ready
    }

    /// Queue a message and try to push it out.
    pub fn send(&mut self, message: &WireMessage) -> Result<(), BackendError> {
        let frame = message.encode()?;
        self.xmit.write(&frame)?;
        self.drain_output()
    }

    /// Push buffered bytes into the pipe until it blocks.
    pub fn drain_output(&mut self) -> Result<(), BackendError> {
        if !self.write_ready {
            return Ok(());
        }
        while !self.xmit.is_empty() {
            let (head, _) = self.xmit.readable();
            match self.stream.write(head) {
                Ok(0) => return Err(BackendError::Closed),
                Ok(n) => self.xmit.commit_read(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.write_ready = false;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BackendError::Io(e)),
            }
        }
        Ok(())
    }

    /// Writability reported by the loop.
    pub fn on_writable(&mut self) -> Result<(), BackendError> {
        self.write_ready = true;
        self.drain_output()
    }

    fn expected(&self) -> usize {
        match self.rx_state {
            RxState::WaitingHeader => HEADER_LEN,
            RxState::WaitingPayload(header) => header.length as usize,
        }
    }

    /// Read everything available and decode complete messages. The
    /// version reply is validated here; anything arriving before a
    /// successful exchange kills the link.
    pub fn drain_input(&mut self) -> Result<Vec<WireMessage>, BackendError> {
        let mut messages = Vec::new();
        loop {
            let expected = self.expected();
            if self.rx_buf.len() < expected {
                self.rx_buf.resize(expected, 0);
            }
            if self.rx_filled < expected {
                match self.stream.read(&mut self.rx_buf[self.rx_filled..expected]) {
                    Ok(0) => return Err(BackendError::Closed),
                    Ok(n) => self.rx_filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(BackendError::Io(e)),
                }
                if self.rx_filled < expected {
                    continue;
                }
            }

            match self.rx_state {
                RxState::WaitingHeader => {
                    let header = MessageHeader::decode(
                        self.rx_buf[..HEADER_LEN].try_into().expect("header size"),
                    );
                    if header.length as usize > msg::MAX_PAYLOAD {
                        return Err(BackendError::Wire(WireError::Oversized(
                            header.length as usize,
                        )));
                    }
                    self.rx_state = RxState::WaitingPayload(header);
                    self.rx_filled = 0;
                }
                RxState::WaitingPayload(header) => {
                    let message =
                        WireMessage::decode(header.msg_type, &self.rx_buf[..header.length as usize])?;
                    self.rx_state = RxState::WaitingHeader;
                    self.rx_filled = 0;
                    if let Some(message) = self.gate_message(message)? {
                        messages.push(message);
                    }
                }
            }
        }
        Ok(messages)
    }

    /// Apply the version handshake rules before messages reach the
    /// connection logic.
    fn gate_message(
        &mut self,
        message: WireMessage,
    ) -> Result<Option<WireMessage>, BackendError> {
        if let WireMessage::VersionReply(version) = &message {
            if version.version_major != PROTOCOL_VERSION_MAJOR {
                return Err(BackendError::VersionMismatch {
                    major: version.version_major,
                    minor: version.version_minor,
                    expected: PROTOCOL_VERSION_MAJOR,
                });
            }
            if version.cookie.as_bytes() != self.props.backend_cookie.as_bytes() {
                return Err(BackendError::CookieMismatch);
            }
            self.version_exchanged = true;
            return Ok(None);
        }
        if !self.version_exchanged {
            return Err(BackendError::EarlyMessage(WireMessage::name(message.tag())));
        }
        Ok(Some(message))
    }

    /* typed send helpers */

    pub fn send_capabilities(
        &mut self,
        capabilities: msg::Capabilities,
    ) -> Result<(), BackendError> {
        self.send(&WireMessage::Capabilities(capabilities))
    }

    pub fn send_sync_keyboard(&mut self, flags: u32, client_id: u32) -> Result<(), BackendError> {
        self.send(&WireMessage::SyncKeyboard(msg::SyncKeyboard {
            flags,
            client_id,
        }))
    }

    pub fn send_scancode(
        &mut self,
        flags: u32,
        code: u32,
        keyboard_type: u32,
        client_id: u32,
    ) -> Result<(), BackendError> {
        self.send(&WireMessage::ScancodeKeyboard(msg::ScancodeKeyboard {
            flags,
            code,
            keyboard_type,
            client_id,
        }))
    }

    pub fn send_unicode(&mut self, flags: u32, code: u32, client_id: u32) -> Result<(), BackendError> {
        self.send(&WireMessage::UnicodeKeyboard(msg::UnicodeKeyboard {
            flags,
            code,
            client_id,
        }))
    }

    pub fn send_mouse(
        &mut self,
        extended: bool,
        flags: u32,
        x: u32,
        y: u32,
        client_id: u32,
    ) -> Result<(), BackendError> {
        let event = msg::Mouse {
            flags,
            x,
            y,
            client_id,
        };
        if extended {
            self.send(&WireMessage::ExtendedMouse(event))
        } else {
            self.send(&WireMessage::Mouse(event))
        }
    }

    pub fn send_sync_request(&mut self, buffer_id: i32) -> Result<(), BackendError> {
        self.send(&WireMessage::FramebufferSyncRequest(
            msg::FramebufferSyncRequest { buffer_id },
        ))?;
        self.waiting_sync_reply = true;
        Ok(())
    }

    pub fn send_immediate_sync_request(&mut self, buffer_id: i32) -> Result<(), BackendError> {
        self.send(&WireMessage::ImmediateSyncRequest(
            msg::FramebufferSyncRequest { buffer_id },
        ))?;
        self.waiting_sync_reply = true;
        Ok(())
    }

    pub fn send_sbp_reply(&mut self, reply: msg::SbpReply) -> Result<(), BackendError> {
        self.send(&WireMessage::SbpReply(reply))
    }

    pub fn send_seat_new(&mut self, seat: msg::SeatNew) -> Result<(), BackendError> {
        self.last_seat_new = Some(seat);
        self.send(&WireMessage::SeatNew(seat))
    }

    pub fn send_seat_removed(&mut self, client_id: u32) -> Result<(), BackendError> {
        self.send(&WireMessage::SeatRemoved(msg::SeatRemoved { client_id }))
    }

    /// Forward a user message, parking the ICP routing data until the
    /// backend replies.
    pub fn send_user_message(
        &mut self,
        mut message: msg::UserMessage,
    ) -> Result<u32, BackendError> {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        message.message_id = message_id;
        self.message_answers
            .insert(message_id, (message.icp_tag, message.icp_type));
        self.send(&WireMessage::Message(message))?;
        Ok(message_id)
    }

    /// Resolve a message reply to its original ICP call.
    #[must_use]
    pub fn take_message_answer(&mut self, message_id: u32) -> Option<(u32, u32)> {
        self.message_answers.remove(&message_id)
    }
}

impl std::fmt::Debug for BackendLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLink")
            .field("endpoint", &self.props.service_endpoint)
            .field("version_exchanged", &self.version_exchanged)
            .field("active", &self.active)
            .field("screen", &self.screen)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    struct FakeBackend {
        stream: UnixStream,
    }

    impl FakeBackend {
        fn read_message(&mut self) -> WireMessage {
            let mut header_buf = [0u8; HEADER_LEN];
            self.stream.read_exact(&mut header_buf).unwrap();
            let header = MessageHeader::decode(&header_buf);
            let mut payload = vec![0u8; header.length as usize];
            self.stream.read_exact(&mut payload).unwrap();
            WireMessage::decode(header.msg_type, &payload).unwrap()
        }

        fn write_message(&mut self, message: &WireMessage) {
            self.stream.write_all(&message.encode().unwrap()).unwrap();
        }
    }

    fn connect_pair(props: BackendProps) -> (BackendLink, FakeBackend) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend");
        let listener = UnixListener::bind(&path).unwrap();

        let thread = std::thread::spawn(move || {
            let stream = UnixStream::connect(&path).unwrap();
            stream.set_nonblocking(true).unwrap();
            stream
        });
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(false).unwrap();
        let client = thread.join().unwrap();

        let mut link = BackendLink {
            stream: client,
            write_ready: true,
            xmit: RingBuffer::new(XMIT_INITIAL, XMIT_CEILING),
            rx_state: RxState::WaitingHeader,
            rx_buf: vec![0; 0x10000],
            rx_filled: 0,
            props,
            version_exchanged: false,
            backend_version: 0,
            multiseat_capable: false,
            waiting_sync_reply: false,
            active: true,
            screen: ScreenInfo::default(),
            damage: None,
            last_system_pointer: msg::SYSPTR_DEFAULT,
            have_backend_pointer: false,
            last_set_pointer: None,
            last_seat_new: None,
            message_answers: HashMap::new(),
            next_message_id: 1,
        };
        link.send(&WireMessage::Version(msg::Version {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            cookie: link.props.server_cookie.clone(),
        }))
        .unwrap();
        (link, FakeBackend { stream: accepted })
    }

    fn props() -> BackendProps {
        BackendProps {
            service_endpoint: "unused".into(),
            server_cookie: "abc".into(),
            backend_cookie: "xyz".into(),
        }
    }

    #[test]
    fn version_handshake_succeeds_with_matching_cookie() {
        let (mut link, mut backend) = connect_pair(props());

        // The link's very first bytes are the Version message with the
        // server cookie.
        match backend.read_message() {
            WireMessage::Version(v) => {
                assert_eq!(v.version_major, PROTOCOL_VERSION_MAJOR);
                assert_eq!(v.cookie, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }

        backend.write_message(&WireMessage::VersionReply(msg::Version {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            cookie: "xyz".into(),
        }));

        // Wait for delivery (the link socket is non-blocking).
        std::thread::sleep(Duration::from_millis(50));
        let messages = link.drain_input().unwrap();
        assert!(messages.is_empty());
        assert!(link.version_exchanged);
    }

    #[test]
    fn version_major_mismatch_kills_the_link() {
        let (mut link, mut backend) = connect_pair(props());
        let _ = backend.read_message();
        backend.write_message(&WireMessage::VersionReply(msg::Version {
            version_major: PROTOCOL_VERSION_MAJOR + 1,
            version_minor: 0,
            cookie: "xyz".into(),
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            link.drain_input(),
            Err(BackendError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn cookie_mismatch_kills_the_link() {
        let (mut link, mut backend) = connect_pair(props());
        let _ = backend.read_message();
        backend.write_message(&WireMessage::VersionReply(msg::Version {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: 0,
            cookie: "wrong".into(),
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            link.drain_input(),
            Err(BackendError::CookieMismatch)
        ));
    }

    #[test]
    fn messages_before_version_reply_are_fatal() {
        let (mut link, mut backend) = connect_pair(props());
        let _ = backend.read_message();
        backend.write_message(&WireMessage::Beep(msg::Beep {
            duration: 1,
            frequency: 2,
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            link.drain_input(),
            Err(BackendError::EarlyMessage(_))
        ));
    }

    #[test]
    fn user_message_reply_table() {
        let (mut link, mut backend) = connect_pair(props());
        let _ = backend.read_message();
        backend.write_message(&WireMessage::VersionReply(msg::Version {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: 0,
            cookie: "xyz".into(),
        }));
        std::thread::sleep(Duration::from_millis(50));
        let _ = link.drain_input().unwrap();

        let id = link
            .send_user_message(msg::UserMessage {
                message_id: 0,
                message_type: 1,
                style: 0,
                timeout: 30,
                parameters: vec!["hello".into()],
                icp_tag: 77,
                icp_type: 22,
            })
            .unwrap();
        assert_eq!(link.take_message_answer(id), Some((77, 22)));
        assert_eq!(link.take_message_answer(id), None);
    }
}
