use super::history::MessageLog;
use super::render::{Renderer, Surface, View};
use super::session::{Action, Key, Session};
use crate::radio::{DeviceLink, TextPacket};

use std::io;
use std::time::{Duration, Instant};

/// Sender shown for inbound messages that carry no sender id.
pub const UNKNOWN_SENDER: &str = "unknown";

/// Whether the event loop keeps going after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// The console as a whole: operator session, message history and the
/// renderer, driven by keys, inbound texts and frame ticks.
pub struct Console {
    session: Session,
    sent: MessageLog,
    received: MessageLog,
    renderer: Renderer,
}

impl Console {
    pub fn new(blink_interval: Duration, history: usize) -> Console {
        Console {
            session: Session::new(blink_interval),
            sent: MessageLog::new(history),
            received: MessageLog::new(history),
            renderer: Renderer::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn sent(&self) -> &MessageLog {
        &self.sent
    }

    pub fn received(&self) -> &MessageLog {
        &self.received
    }

    /// Applies one key. Sending happens here, through `link`; a failed
    /// send is logged and leaves the sent history untouched.
    pub fn on_key<L: DeviceLink + ?Sized>(&mut self, key: Key, link: &L) -> Flow {
        match self.session.handle_key(key) {
            Action::Quit => return Flow::Quit,
            Action::Send(text) => {
                let channel = self.session.channel();
                match link.send_text(&text, channel) {
                    Ok(()) => {
                        tracing::info!("sent {} bytes on channel {}", text.len(), channel);
                        self.sent.push(format!("Channel {}", channel), text);
                    }
                    Err(e) => tracing::error!("failed to send message: {e}"),
                }
            }
            Action::EnterSetChannel => tracing::debug!("entering channel selection"),
            Action::ChannelChanged(n) => tracing::info!("switched to channel {}", n),
            Action::ChannelRejected(input) => {
                tracing::warn!("invalid channel {:?}, keeping {}", input, self.session.channel())
            }
            Action::None => {}
        }
        Flow::Continue
    }

    /// Records an inbound text. Returns whether anything changed; events
    /// without text are dropped.
    pub fn on_receive(&mut self, packet: Option<&TextPacket>) -> bool {
        let Some(packet) = packet else {
            tracing::debug!("ignoring empty receive event");
            return false;
        };
        let Some(text) = &packet.text else {
            tracing::debug!("ignoring receive event without text");
            return false;
        };
        let from = packet.from_id.as_deref().unwrap_or(UNKNOWN_SENDER);
        tracing::info!("message from {}", from);
        self.received.push(from, text.as_str());
        true
    }

    /// Advances the indicator and paints a full frame.
    pub fn redraw<S, L>(&mut self, surface: &mut S, link: &L) -> io::Result<()>
    where
        S: Surface + ?Sized,
        L: DeviceLink + ?Sized,
    {
        self.redraw_at(surface, link, Instant::now())
    }

    pub fn redraw_at<S, L>(&mut self, surface: &mut S, link: &L, now: Instant) -> io::Result<()>
    where
        S: Surface + ?Sized,
        L: DeviceLink + ?Sized,
    {
        self.session.blink.advance(now);
        let view = View {
            session: &self.session,
            received: &self.received,
            sent: &self.sent,
        };
        self.renderer.paint(surface, &view, link)
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::new(Duration::ZERO, super::history::DEFAULT_CAPACITY)
    }
}
