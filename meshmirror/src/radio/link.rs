//! Device link
//!
//! `DeviceLink` is everything the console needs from a radio: a snapshot of
//! the local node, the table of known nodes, and sending text. Inbound text
//! is not part of the trait; `SerialLink` hands it out as a bounded channel
//! of `TextPacket`s, drained by whoever drives the console.

use super::nodedb::{NodeDb, NodeSnapshot, Peer, Update};
use super::port::{self, RecvError};
use super::proto::{self, mesh_packet, Data, MeshPacket, PortNum, ToRadio};

use crossbeam::channel;
use std::io;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("radio did not finish sending its configuration within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("radio link is closed")]
    Disconnected,
    #[error("message is {0} bytes, the limit is {max}", max = proto::MAX_TEXT_LEN)]
    PayloadTooBig(usize),
    #[error("local node information not received yet")]
    NodeUnknown,
    #[error("send failed: {0}")]
    Send(#[from] port::SendError),
}

/// An inbound text event. Either field may be missing when the radio
/// delivered something that could not be attributed or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextPacket {
    pub from_id: Option<String>,
    pub text: Option<String>,
}

impl TextPacket {
    pub fn new(from_id: &str, text: &str) -> TextPacket {
        TextPacket {
            from_id: Some(from_id.to_string()),
            text: Some(text.to_string()),
        }
    }
}

/// The operations the console consumes from a connected radio.
pub trait DeviceLink {
    /// Describes the local node.
    fn own_node(&self) -> Result<NodeSnapshot, LinkError>;
    /// Lists every node the radio knows about.
    fn peers(&self) -> Result<Vec<Peer>, LinkError>;
    /// Broadcasts `text` on channel index `channel`.
    fn send_text(&self, text: &str, channel: u8) -> Result<(), LinkError>;
}

/// Options for opening a `SerialLink`.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub baud: u32,
    /// How long to wait for the radio to dump its configuration.
    pub handshake_timeout: Duration,
    /// Capacity of the inbound text channel.
    pub text_queue: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            baud: port::serial::DEFAULT_RATE,
            handshake_timeout: Duration::from_secs(60),
            text_queue: 64,
        }
    }
}

/// Hop limit given to outgoing packets.
const HOP_LIMIT: u32 = 3;

/// `DeviceLink` to a radio on a local serial port. Dropping it tells the
/// radio the client is leaving and closes the device.
pub struct SerialLink {
    port: Arc<port::Port>,
    db: Arc<RwLock<NodeDb>>,
    texts: channel::Receiver<TextPacket>,
}

/// Events the port thread forwards to the link owner.
#[derive(Debug, PartialEq, Eq)]
enum LinkEvent {
    ConfigComplete(u32),
    Rebooted,
}

impl SerialLink {
    /// Opens `path`, requests the radio's configuration and waits until
    /// it has been received in full.
    pub fn connect(path: &str, options: &LinkOptions) -> Result<SerialLink, LinkError> {
        let open_error = |source| LinkError::Open {
            path: path.to_string(),
            source,
        };
        let raw_port = port::serial::Port::new(path, options.baud).map_err(open_error)?;
        let (link, event_rx) = SerialLink::start(raw_port, options).map_err(open_error)?;
        link.handshake(&event_rx, options.handshake_timeout)?;
        if let Ok(db) = link.db.read() {
            tracing::info!("radio configuration received, {} nodes known", db.len());
        }
        link.watch_reboots(event_rx);
        Ok(link)
    }

    /// Starts the port thread without talking to the radio yet.
    fn start(
        raw_port: port::serial::Port,
        options: &LinkOptions,
    ) -> io::Result<(SerialLink, channel::Receiver<LinkEvent>)> {
        let db = Arc::new(RwLock::new(NodeDb::new()));
        let (text_tx, text_rx) = channel::bounded(options.text_queue.max(1));
        let (event_tx, event_rx) = channel::unbounded();
        let port = port::Port::new(
            raw_port,
            SerialLink::rx_handler(db.clone(), text_tx, event_tx),
        )?;
        let link = SerialLink {
            port: Arc::new(port),
            db,
            texts: text_rx,
        };
        Ok((link, event_rx))
    }

    /// Requests the configuration and waits until all of it has arrived.
    fn handshake(
        &self,
        event_rx: &channel::Receiver<LinkEvent>,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let mut config_id = self.request_config()?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match event_rx.recv_timeout(remaining) {
                Ok(LinkEvent::ConfigComplete(id)) if id == config_id => break,
                Ok(LinkEvent::ConfigComplete(id)) => {
                    tracing::debug!("ignoring stale config completion {id:#010x}");
                }
                Ok(LinkEvent::Rebooted) => {
                    tracing::warn!("radio rebooted during handshake");
                    config_id = self.request_config()?;
                }
                Err(channel::RecvTimeoutError::Timeout) => {
                    return Err(LinkError::HandshakeTimeout(timeout));
                }
                Err(channel::RecvTimeoutError::Disconnected) => {
                    return Err(LinkError::Disconnected);
                }
            }
        }
        Ok(())
    }

    /// Receiver of inbound text messages.
    pub fn texts(&self) -> channel::Receiver<TextPacket> {
        self.texts.clone()
    }

    /// Drops the link and waits up to `timeout` for the port thread to
    /// close the device. Returns false if it is still running.
    pub fn close(self, timeout: Duration) -> bool {
        let texts = self.texts.clone();
        drop(self);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match texts.recv_timeout(remaining) {
                Ok(_) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => return true,
                Err(channel::RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    fn request_config(&self) -> Result<u32, LinkError> {
        request_config(&self.port)
    }

    /// After the handshake, a radio reboot only needs a fresh
    /// configuration request; the node database is already cleared.
    /// The watcher does not keep the port alive: it ends once the port
    /// thread drops the event sender.
    fn watch_reboots(&self, event_rx: channel::Receiver<LinkEvent>) {
        let port = Arc::downgrade(&self.port);
        std::thread::spawn(move || {
            for event in event_rx.iter() {
                if let LinkEvent::Rebooted = event {
                    tracing::warn!("radio rebooted, requesting configuration again");
                    if !rerequest_config(&port) {
                        break;
                    }
                }
            }
        });
    }

    /// Returns the callback run on the port thread for every received
    /// message: it updates the node database and forwards text and
    /// session events.
    fn rx_handler(
        db: Arc<RwLock<NodeDb>>,
        texts: channel::Sender<TextPacket>,
        events: channel::Sender<LinkEvent>,
    ) -> impl Fn(Result<proto::FromRadio, RecvError>) -> io::Result<()> + Send + 'static {
        move |rxdata| -> io::Result<()> {
            let msg = match rxdata {
                Ok(msg) => msg,
                Err(RecvError::Protocol(proto::Error::Text(line))) => {
                    tracing::debug!(target: "radio_console", "{line}");
                    return Ok(());
                }
                Err(RecvError::Protocol(e)) => {
                    tracing::warn!("protocol error: {e}");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!("radio link lost: {e}");
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                }
            };
            let update = match db.write() {
                Ok(mut db) => db.apply(msg),
                Err(_) => return Err(io::Error::from(io::ErrorKind::Other)),
            };
            match update {
                Update::Nothing => {}
                Update::Text {
                    from_id,
                    text,
                    channel: index,
                } => {
                    tracing::debug!("text from {from_id} on channel {index}");
                    if let Err(channel::TrySendError::Full(_)) =
                        texts.try_send(TextPacket::new(&from_id, &text))
                    {
                        tracing::warn!("inbound text queue full, dropping message from {from_id}");
                    }
                }
                Update::ConfigComplete(id) => {
                    let _ = events.send(LinkEvent::ConfigComplete(id));
                }
                Update::Rebooted => {
                    let _ = events.send(LinkEvent::Rebooted);
                }
            }
            Ok(())
        }
    }
}

fn request_config(port: &port::Port) -> Result<u32, LinkError> {
    let id = loop {
        let id: u32 = rand::random();
        if id != 0 {
            break id;
        }
    };
    port.send(ToRadio::want_config(id))?;
    tracing::info!("requested radio configuration (id {id:#010x})");
    Ok(id)
}

/// Returns false once the link is gone or the request cannot be queued.
fn rerequest_config(port: &Weak<port::Port>) -> bool {
    let Some(port) = port.upgrade() else {
        return false;
    };
    match request_config(&port) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("configuration request failed: {e}");
            false
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if let Err(e) = self.port.try_send(ToRadio::disconnect()) {
            tracing::debug!("disconnect not sent: {e}");
        }
    }
}

impl DeviceLink for SerialLink {
    fn own_node(&self) -> Result<NodeSnapshot, LinkError> {
        let db = self.db.read().map_err(|_| LinkError::Disconnected)?;
        db.own_node().ok_or(LinkError::NodeUnknown)
    }

    fn peers(&self) -> Result<Vec<Peer>, LinkError> {
        let db = self.db.read().map_err(|_| LinkError::Disconnected)?;
        Ok(db.peers())
    }

    fn send_text(&self, text: &str, channel: u8) -> Result<(), LinkError> {
        if text.len() > proto::MAX_TEXT_LEN {
            return Err(LinkError::PayloadTooBig(text.len()));
        }
        let pkt = MeshPacket {
            to: proto::BROADCAST_NUM,
            channel: channel.into(),
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PortNum::TextMessageApp.into(),
                payload: text.as_bytes().to_vec(),
                want_response: false,
            })),
            id: rand::random::<u32>() | 1,
            hop_limit: HOP_LIMIT,
            ..Default::default()
        };
        match self.port.try_send(ToRadio::packet(pkt)) {
            Ok(()) => Ok(()),
            Err(port::SendError::Disconnected) => Err(LinkError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::proto::{from_radio, to_radio, FromRadio};
    use channel::RecvTimeoutError;

    fn text(from: u32, body: &str) -> FromRadio {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::Packet(MeshPacket {
                from,
                to: proto::BROADCAST_NUM,
                payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                    portnum: PortNum::TextMessageApp.into(),
                    payload: body.as_bytes().to_vec(),
                    want_response: false,
                })),
                ..Default::default()
            })),
        }
    }

    fn handler(
        queue: usize,
    ) -> (
        impl Fn(Result<proto::FromRadio, RecvError>) -> io::Result<()>,
        channel::Receiver<TextPacket>,
        channel::Receiver<LinkEvent>,
        Arc<RwLock<NodeDb>>,
    ) {
        let db = Arc::new(RwLock::new(NodeDb::new()));
        let (text_tx, text_rx) = channel::bounded(queue);
        let (event_tx, event_rx) = channel::unbounded();
        let rx = SerialLink::rx_handler(db.clone(), text_tx, event_tx);
        (rx, text_rx, event_rx, db)
    }

    #[test]
    fn text_packets_are_queued() {
        let (rx, texts, _, _) = handler(4);
        rx(Ok(text(0xabcd, "hi"))).unwrap();
        assert_eq!(texts.try_recv(), Ok(TextPacket::new("!0000abcd", "hi")));
    }

    #[test]
    fn full_text_queue_drops_newest() {
        let (rx, texts, _, _) = handler(1);
        rx(Ok(text(1, "first"))).unwrap();
        rx(Ok(text(1, "second"))).unwrap();
        assert_eq!(texts.try_recv(), Ok(TextPacket::new("!00000001", "first")));
        assert!(texts.try_recv().is_err());
    }

    #[test]
    fn console_text_and_bad_frames_are_not_fatal() {
        let (rx, texts, events, _) = handler(4);
        let line = proto::Error::Text("INFO | booting".into());
        assert!(rx(Err(RecvError::Protocol(line))).is_ok());
        assert!(rx(Err(RecvError::Protocol(proto::Error::FrameTooBig(9000)))).is_ok());
        assert!(texts.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn lost_device_closes_port() {
        let (rx, _, _, _) = handler(4);
        assert!(rx(Err(RecvError::Disconnected)).is_err());
        let io_err = io::Error::from(io::ErrorKind::TimedOut);
        assert!(rx(Err(RecvError::IO(io_err))).is_err());
    }

    #[test]
    fn poisoned_database_closes_port() {
        let (rx, texts, _, db) = handler(4);
        let db2 = db.clone();
        let _ = std::thread::spawn(move || {
            let _guard = db2.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(db.is_poisoned());
        assert!(rx(Ok(text(1, "lost"))).is_err());
        assert!(texts.is_empty());
    }

    #[test]
    fn session_events_are_forwarded() {
        let (rx, _, events, db) = handler(4);
        let msg = |v| FromRadio {
            id: 0,
            payload_variant: Some(v),
        };
        rx(Ok(msg(from_radio::PayloadVariant::ConfigCompleteId(77)))).unwrap();
        rx(Ok(text(5, "x"))).unwrap();
        assert_eq!(db.read().unwrap().len(), 1);
        rx(Ok(msg(from_radio::PayloadVariant::Rebooted(true)))).unwrap();
        assert_eq!(events.try_recv(), Ok(LinkEvent::ConfigComplete(77)));
        assert_eq!(events.try_recv(), Ok(LinkEvent::Rebooted));
        assert!(db.read().unwrap().is_empty());
    }

    #[cfg(unix)]
    mod device {
        use super::*;
        use prost::Message;
        use std::io::Read;

        /// A link whose port thread talks to one end of a pty pair.
        fn pty_link() -> (
            SerialLink,
            channel::Receiver<LinkEvent>,
            mio_serial::SerialStream,
        ) {
            let (radio, host) = mio_serial::SerialStream::pair().unwrap();
            let raw_port = port::serial::Port::from_stream(host).unwrap();
            let (link, events) = SerialLink::start(raw_port, &LinkOptions::default()).unwrap();
            (link, events, radio)
        }

        fn take_frame(buf: &mut Vec<u8>) -> Option<ToRadio> {
            loop {
                let start = buf
                    .windows(2)
                    .position(|w| w == [proto::START1, proto::START2])?;
                buf.drain(..start);
                if buf.len() < proto::HEADER_LEN {
                    return None;
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if buf.len() < proto::HEADER_LEN + len {
                    return None;
                }
                let frame: Vec<u8> = buf.drain(..proto::HEADER_LEN + len).collect();
                if let Ok(msg) = ToRadio::decode(&frame[proto::HEADER_LEN..]) {
                    return Some(msg);
                }
            }
        }

        /// Reads frames the radio end receives until one matches.
        fn radio_sees(radio: &mut mio_serial::SerialStream, want: impl Fn(&ToRadio) -> bool) -> bool {
            let deadline = Instant::now() + Duration::from_secs(3);
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            while Instant::now() < deadline {
                match radio.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
                while let Some(msg) = take_frame(&mut buf) {
                    if want(&msg) {
                        return true;
                    }
                }
            }
            false
        }

        #[test]
        fn reboot_requests_configuration_again() {
            let (link, _events, mut radio) = pty_link();
            let (event_tx, event_rx) = channel::unbounded();
            link.watch_reboots(event_rx);
            event_tx.send(LinkEvent::Rebooted).unwrap();
            assert!(radio_sees(&mut radio, |msg| matches!(
                msg.payload_variant,
                Some(to_radio::PayloadVariant::WantConfigId(id)) if id != 0
            )));
        }

        #[test]
        fn close_waits_for_port_thread() {
            let (link, events, _radio) = pty_link();
            link.watch_reboots(events);
            assert!(link.close(Duration::from_secs(3)));
        }

        #[test]
        fn dropping_link_releases_device() {
            let (link, events, mut radio) = pty_link();
            link.watch_reboots(events);
            let texts = link.texts();
            drop(link);

            // The text sender lives on the port thread, so this only
            // disconnects once that thread has closed the device.
            assert_eq!(
                texts.recv_timeout(Duration::from_secs(3)),
                Err(RecvTimeoutError::Disconnected)
            );
            assert!(radio_sees(&mut radio, |msg| {
                msg.payload_variant == Some(to_radio::PayloadVariant::Disconnect(true))
            }));
        }
    }
}
