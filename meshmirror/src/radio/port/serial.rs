//! Serial Port
//!
//! Raw access to the radio's USB serial link, as an MIO event source.
//! `ToRadio` messages are sent in frames (see `proto::ToRadio::to_frame`).
//! When receiving, anything outside of a frame is the radio's debug console:
//! it is split on newlines and returned as
//! `RecvError::Protocol(proto::Error::Text(line))`.

use super::{proto, RecvError, SendError};
use mio_serial::SerialPortBuilderExt;
use prost::Message;
use std::io;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Default data rate on the serial port.
pub static DEFAULT_RATE: u32 = 115200;

/// Discard anything for this long after the port is opened.
static HOLDOFF_TIME: Duration = Duration::from_millis(50);

/// A partial frame older than this is dropped.
static STALE_TIME: Duration = Duration::from_millis(200);

/// Bytes sent right after opening, to wake the radio's serial API.
const WAKE_BURST_LEN: usize = 32;

/// Longest console line kept before it is returned regardless of newlines.
const MAX_LINE_LEN: usize = 256;

/// Incremental decoder for the radio's serial stream.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    line: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True if a frame or console line has been started but not completed.
    pub fn pending(&self) -> bool {
        !self.buf.is_empty() || !self.line.is_empty()
    }

    /// Drops everything buffered so far.
    pub fn flush(&mut self) {
        self.buf.clear();
        self.line.clear();
    }

    /// Extracts the next message from the buffered data. Returns
    /// `RecvError::NotReady` when more data is needed.
    pub fn next(&mut self) -> Result<proto::FromRadio, RecvError> {
        loop {
            if self.buf.is_empty() {
                return Err(RecvError::NotReady);
            }
            if self.buf[0] == proto::START1 {
                if self.buf.len() < 2 {
                    return Err(RecvError::NotReady);
                }
                if self.buf[1] == proto::START2 {
                    if self.buf.len() < proto::HEADER_LEN {
                        return Err(RecvError::NotReady);
                    }
                    let declared = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                    if declared > proto::MAX_PAYLOAD_LEN {
                        // Not a real header, resync one byte further.
                        self.buf.drain(..1);
                        return Err(RecvError::Protocol(proto::Error::FrameTooBig(declared)));
                    }
                    let total = proto::HEADER_LEN + declared;
                    if self.buf.len() < total {
                        return Err(RecvError::NotReady);
                    }
                    let res = proto::FromRadio::decode(&self.buf[proto::HEADER_LEN..total]);
                    self.buf.drain(..total);
                    return res.map_err(|e| RecvError::Protocol(e.into()));
                }
            }
            if let Some(text) = self.take_console_byte() {
                return Err(RecvError::Protocol(proto::Error::Text(text)));
            }
        }
    }

    /// Moves the first buffered byte into the console line. Returns the
    /// line once it is terminated.
    fn take_console_byte(&mut self) -> Option<String> {
        let byte = self.buf.remove(0);
        if byte == b'\n' || byte == b'\r' {
            if self.line.is_empty() {
                return None;
            }
        } else {
            self.line.push(byte);
            if self.line.len() < MAX_LINE_LEN {
                return None;
            }
        }
        let text = String::from_utf8_lossy(&self.line).trim_end().to_string();
        self.line.clear();
        Some(text)
    }
}

/// Raw serial connection to a radio.
pub struct Port {
    /// Underlying serial port stream
    port: mio_serial::SerialStream,
    decoder: FrameDecoder,
    /// Instant when we received data most recently. Used to drop
    /// partial frames that will never complete.
    last_rx: Instant,
    /// Bytes of a frame that could not be written yet.
    txbuf: Vec<u8>,
    /// Time when the port is initialized, used for startup_holdoff
    startup_time: Instant,
}

impl Port {
    /// Opens the serial device at `path` with the given data rate, 8N1,
    /// and writes the wake burst.
    pub fn new(path: &str, rate: u32) -> Result<Port, io::Error> {
        let mio_port = mio_serial::new(path, rate)
            .data_bits(mio_serial::DataBits::Eight)
            .parity(mio_serial::Parity::None)
            .stop_bits(mio_serial::StopBits::One)
            .open_native_async()?;
        #[cfg(windows)]
        {
            // Windows requires some custom settings to replicate the unix behavior.
            use std::os::windows::io::AsRawHandle;
            use winapi::um::commapi::SetCommTimeouts;
            use winapi::um::winbase::COMMTIMEOUTS;
            let handle = mio_port.as_raw_handle();
            let mut timeouts = COMMTIMEOUTS {
                ReadIntervalTimeout: 0xFFFFFFFF,
                ReadTotalTimeoutMultiplier: 0xFFFFFFFF,
                ReadTotalTimeoutConstant: 0xFFFFFFFE,
                WriteTotalTimeoutMultiplier: 0,
                WriteTotalTimeoutConstant: 0,
            };
            if unsafe { SetCommTimeouts(handle, &mut timeouts) } == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Port::from_stream(mio_port)
    }

    /// Takes over an already configured stream and writes the wake burst.
    pub fn from_stream(mut stream: mio_serial::SerialStream) -> Result<Port, io::Error> {
        match stream.write(&[proto::START2; WAKE_BURST_LEN]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(Port {
            port: stream,
            decoder: FrameDecoder::new(),
            last_rx: Instant::now(),
            txbuf: Vec::new(),
            startup_time: Instant::now(),
        })
    }

    /// Returns a message without blocking, or `RecvError::NotReady` if
    /// one is not available.
    pub fn recv(&mut self) -> Result<proto::FromRadio, RecvError> {
        let mut res = self.decoder.next();
        if let Err(RecvError::NotReady) = res {
            let now = Instant::now();
            if self.decoder.pending() && now.duration_since(self.last_rx) > STALE_TIME {
                self.decoder.flush();
            }
            let mut chunk = [0u8; 512];
            loop {
                match self.port.read(&mut chunk) {
                    Ok(0) => return Err(RecvError::Disconnected),
                    Ok(size) => {
                        self.last_rx = now;
                        // Readiness is edge triggered, so keep reading
                        // while discarding during the holdoff.
                        if self.startup_holdoff() {
                            continue;
                        }
                        self.decoder.push(&chunk[..size]);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Err(RecvError::NotReady);
                    }
                    Err(e) => {
                        #[cfg(target_os = "macos")]
                        // On macos, disconnecting a serial port while connected will
                        // generate this error, so translate it.
                        if Some(6) == e.raw_os_error() {
                            return Err(RecvError::Disconnected);
                        }
                        return Err(RecvError::IO(e));
                    }
                }
            }
            res = self.decoder.next();
        }
        res
    }

    /// Attempts to send a message. On `MustDrain` the frame was written
    /// partially and `drain()` must complete before anything else is sent.
    pub fn send(&mut self, msg: &proto::ToRadio) -> Result<(), SendError> {
        if self.has_data_to_drain() {
            return Err(SendError::Full);
        }
        let frame = msg.to_frame().map_err(|_| SendError::Serialization)?;
        match self.port.write(&frame) {
            Ok(size) if size == frame.len() => Ok(()),
            Ok(size) => {
                self.txbuf.extend_from_slice(&frame[size..]);
                Err(SendError::MustDrain)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.txbuf.extend_from_slice(&frame);
                Err(SendError::MustDrain)
            }
            Err(e) => Err(SendError::IO(e)),
        }
    }

    /// Writes out what is left of a partially sent frame.
    pub fn drain(&mut self) -> Result<(), SendError> {
        if self.txbuf.is_empty() {
            return Ok(());
        }
        match self.port.write(&self.txbuf) {
            Ok(size) => {
                self.txbuf.drain(..size);
                if self.txbuf.is_empty() {
                    Ok(())
                } else {
                    Err(SendError::MustDrain)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SendError::MustDrain),
            Err(e) => Err(SendError::IO(e)),
        }
    }

    pub fn has_data_to_drain(&self) -> bool {
        !self.txbuf.is_empty()
    }

    /// The radio drops its API session when nothing arrives for too long.
    pub fn max_send_interval(&self) -> Duration {
        Duration::from_secs(300)
    }

    /// True while data received should be discarded and nothing sent.
    pub fn startup_holdoff(&self) -> bool {
        self.startup_time.elapsed() < HOLDOFF_TIME
    }
}

impl mio::event::Source for Port {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.port.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.port.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.port.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::proto::{from_radio, FromRadio, MyNodeInfo};

    fn frame_of(msg: &FromRadio) -> Vec<u8> {
        let payload = msg.encode_to_vec();
        let mut frame = vec![proto::START1, proto::START2];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    fn my_info(num: u32) -> FromRadio {
        FromRadio {
            id: 7,
            payload_variant: Some(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
                my_node_num: num,
            })),
        }
    }

    #[test]
    fn decodes_frame_split_across_reads() {
        let frame = frame_of(&my_info(0xabcd));
        let mut dec = FrameDecoder::new();
        dec.push(&frame[..3]);
        assert!(matches!(dec.next(), Err(RecvError::NotReady)));
        dec.push(&frame[3..]);
        assert_eq!(dec.next().unwrap(), my_info(0xabcd));
        assert!(!dec.pending());
    }

    #[test]
    fn console_text_is_returned_by_line() {
        let mut dec = FrameDecoder::new();
        dec.push(b"INFO | booting\r\n");
        dec.push(&frame_of(&my_info(1)));
        match dec.next() {
            Err(RecvError::Protocol(proto::Error::Text(t))) => assert_eq!(t, "INFO | booting"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(dec.next().unwrap(), my_info(1));
    }

    #[test]
    fn resyncs_after_bogus_header() {
        let mut dec = FrameDecoder::new();
        dec.push(&[proto::START1, proto::START2, 0xFF, 0xFF]);
        dec.push(&frame_of(&my_info(3)));
        assert!(matches!(
            dec.next(),
            Err(RecvError::Protocol(proto::Error::FrameTooBig(0xFFFF)))
        ));
        // The leftover header bytes read as console noise until the real frame.
        let mut got = None;
        for _ in 0..8 {
            match dec.next() {
                Ok(msg) => {
                    got = Some(msg);
                    break;
                }
                Err(RecvError::Protocol(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(got, Some(my_info(3)));
    }
}
