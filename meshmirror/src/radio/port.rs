//! Radio port
//!
//! The `Port` object owns the serial connection to the radio and runs it
//! from a dedicated thread, which:
//! - bridges `mio` readiness on the serial device with a `crossbeam`
//!   channel of outgoing `ToRadio` messages,
//! - passes every received message (or receive error) to an owned callback,
//! - queues partially written frames and drains them as the device allows,
//! - enforces the startup holdoff,
//! - sends a heartbeat whenever the link has been idle for too long.
//!
//! The thread exits, closing the device, once the `Port` is dropped.

pub mod serial;

use super::proto::{self, FromRadio, ToRadio};
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Possible errors when receiving from a `Port`
#[derive(Error, Debug)]
pub enum RecvError {
    /// No message available at this time.
    #[error("no data ready")]
    NotReady,
    /// The device went away.
    #[error("serial device disconnected")]
    Disconnected,
    /// Error in the data.
    #[error(transparent)]
    Protocol(#[from] proto::Error),
    /// Low level IO error.
    #[error("serial io: {0}")]
    IO(io::Error),
}

/// Possible errors when sending to a `Port`
#[derive(Error, Debug)]
pub enum SendError {
    /// A frame was written partially and must be drained. Only ever seen
    /// between the raw serial port and the port thread.
    #[error("partial write pending")]
    MustDrain,
    /// The outgoing queue is full.
    #[error("send queue full")]
    Full,
    /// The port thread has terminated.
    #[error("port disconnected")]
    Disconnected,
    /// Issue with the underlying IO operation.
    #[error("serial io: {0}")]
    IO(io::Error),
    /// Message would exceed the frame size limit.
    #[error("message does not fit in a frame")]
    Serialization,
}

const SERIAL_TOKEN: mio::Token = mio::Token(1);
const WAKER_TOKEN: mio::Token = mio::Token(0);

/// Depth of the outgoing message queue.
static TX_QUEUE_SIZE: usize = 32;

/// Handle to the thread servicing a serial radio connection.
pub struct Port {
    /// Only `None` while dropping.
    tx: Option<crossbeam::channel::Sender<ToRadio>>,
    waker: mio::Waker,
}

impl Port {
    /// Event loop of the `Port` thread.
    fn poller_thread<RxCallbackT: Fn(Result<FromRadio, RecvError>) -> io::Result<()>>(
        mut raw_port: serial::Port,
        mut poll: mio::Poll,
        rx: RxCallbackT,
        tx: crossbeam::channel::Receiver<ToRadio>,
    ) {
        use crossbeam::channel::TryRecvError;

        let mut events = mio::Events::with_capacity(4);
        let mut needs_draining = false;
        // Set when queued messages were left behind while draining or
        // during the startup holdoff.
        let mut needs_tx_queue_check = false;

        if let Err(e) = poll
            .registry()
            .register(&mut raw_port, SERIAL_TOKEN, mio::Interest::READABLE)
        {
            tracing::error!("serial port registration failed: {e}");
            return;
        }

        let mut last_sent = Instant::now();
        let mut startup = raw_port.startup_holdoff();
        let mut heartbeat_nonce: u32 = 0;

        'ioloop: loop {
            let timeout = if needs_draining {
                None
            } else {
                let max_interval = raw_port.max_send_interval();
                let mut until_hb = max_interval.saturating_sub(last_sent.elapsed());
                if until_hb == Duration::ZERO && !startup {
                    heartbeat_nonce = heartbeat_nonce.wrapping_add(1);
                    match raw_port.send(&ToRadio::heartbeat(heartbeat_nonce)) {
                        Err(SendError::MustDrain) => {
                            needs_draining = true;
                            if Port::set_writable(&mut poll, &mut raw_port, true).is_err() {
                                break 'ioloop;
                            }
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("heartbeat failed: {e}");
                            break 'ioloop;
                        }
                        Ok(()) => {
                            tracing::trace!("heartbeat sent");
                            last_sent = Instant::now();
                            until_hb = max_interval;
                        }
                    }
                }
                if startup {
                    until_hb = until_hb.min(Duration::from_millis(10));
                }
                // Sleep an additional millisecond, otherwise on some systems
                // we spin for the last sub-millisecond.
                Some(until_hb + Duration::from_millis(1))
            };

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("serial poll failed: {e}");
                break 'ioloop;
            }

            if startup {
                startup = raw_port.startup_holdoff();
                if !startup {
                    needs_tx_queue_check = true;
                }
            }

            let mut check_tx_channel = false;

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        if needs_draining || startup {
                            needs_tx_queue_check = true;
                        } else {
                            check_tx_channel = true;
                        }
                    }
                    SERIAL_TOKEN => {
                        if event.is_writable() && needs_draining {
                            match raw_port.drain() {
                                Ok(()) => {
                                    needs_draining = false;
                                    needs_tx_queue_check = true;
                                    if Port::set_writable(&mut poll, &mut raw_port, false)
                                        .is_err()
                                    {
                                        break 'ioloop;
                                    }
                                    last_sent = Instant::now();
                                }
                                Err(SendError::MustDrain) => {}
                                Err(e) => {
                                    tracing::warn!("serial drain failed: {e}");
                                    break 'ioloop;
                                }
                            }
                        }
                        loop {
                            match raw_port.recv() {
                                Ok(msg) => {
                                    if rx(Ok(msg)).is_err() {
                                        break 'ioloop;
                                    }
                                }
                                Err(RecvError::NotReady) => break,
                                Err(e) => {
                                    let fatal = matches!(
                                        e,
                                        RecvError::Disconnected | RecvError::IO(_)
                                    );
                                    if rx(Err(e)).is_err() || fatal {
                                        break 'ioloop;
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            if !needs_draining && !startup && needs_tx_queue_check {
                check_tx_channel = true;
                needs_tx_queue_check = false;
            }

            if check_tx_channel {
                loop {
                    match tx.try_recv() {
                        Ok(msg) => match raw_port.send(&msg) {
                            Ok(()) => {
                                last_sent = Instant::now();
                            }
                            Err(SendError::MustDrain) => {
                                needs_draining = true;
                                needs_tx_queue_check = true;
                                if Port::set_writable(&mut poll, &mut raw_port, true).is_err() {
                                    break 'ioloop;
                                }
                                break;
                            }
                            Err(SendError::Serialization) => {
                                tracing::warn!("dropping oversized outgoing message");
                            }
                            Err(e) => {
                                tracing::warn!("serial send failed: {e}");
                                break 'ioloop;
                            }
                        },
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'ioloop,
                    }
                }
            }
        }
        tracing::debug!("serial port thread exiting");
    }

    fn set_writable(
        poll: &mut mio::Poll,
        raw_port: &mut serial::Port,
        writable: bool,
    ) -> io::Result<()> {
        let interest = if writable {
            mio::Interest::READABLE.add(mio::Interest::WRITABLE)
        } else {
            mio::Interest::READABLE
        };
        poll.registry()
            .reregister(raw_port, SERIAL_TOKEN, interest)
            .map_err(|e| {
                tracing::error!("serial port reregistration failed: {e}");
                e
            })
    }

    /// Starts the port thread on an opened serial device.
    ///
    /// The RX callback is called from the port thread with the result of
    /// every receive on the device. If it returns an `Err()`, the port is
    /// closed. The port is also closed after passing along a disconnect
    /// or IO error.
    pub fn new<RXT: Fn(Result<FromRadio, RecvError>) -> io::Result<()> + Send + 'static>(
        raw_port: serial::Port,
        rx: RXT,
    ) -> io::Result<Port> {
        let (tx, ttx) = crossbeam::channel::bounded::<ToRadio>(TX_QUEUE_SIZE);
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;
        thread::Builder::new()
            .name("radio-port".into())
            .spawn(move || Port::poller_thread(raw_port, poll, rx, ttx))?;
        Ok(Port {
            tx: Some(tx),
            waker,
        })
    }

    fn sender(&self) -> Result<&crossbeam::channel::Sender<ToRadio>, SendError> {
        self.tx.as_ref().ok_or(SendError::Disconnected)
    }

    /// Queues a message for the radio. Blocks if the queue is backed up.
    pub fn send(&self, msg: ToRadio) -> Result<(), SendError> {
        if self.sender()?.send(msg).is_err() {
            return Err(SendError::Disconnected);
        }
        self.waker.wake().map_err(SendError::IO)
    }

    /// Queues a message for the radio without blocking.
    pub fn try_send(&self, msg: ToRadio) -> Result<(), SendError> {
        use crossbeam::channel::TrySendError;
        match self.sender()?.try_send(msg) {
            Ok(()) => self.waker.wake().map_err(SendError::IO),
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SendError::Disconnected),
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // The thread only notices the closed queue when woken.
        drop(self.tx.take());
        if let Err(e) = self.waker.wake() {
            tracing::warn!("failed to stop serial port thread: {e}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crossbeam::channel::{self, RecvTimeoutError};

    #[test]
    fn dropping_port_stops_thread() {
        let (_device, host) = mio_serial::SerialStream::pair().unwrap();
        let raw_port = serial::Port::from_stream(host).unwrap();
        // Disconnects once the thread has dropped its callback.
        let (alive_tx, alive_rx) = channel::bounded::<()>(1);
        let port = Port::new(raw_port, move |_| {
            let _alive = &alive_tx;
            Ok(())
        })
        .unwrap();
        port.try_send(ToRadio::heartbeat(1)).unwrap();

        drop(port);
        assert_eq!(
            alive_rx.recv_timeout(Duration::from_secs(2)),
            Err(RecvTimeoutError::Disconnected)
        );
    }
}
