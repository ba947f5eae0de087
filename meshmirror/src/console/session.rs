//! Operator session state and its keyboard state machine.

use std::time::{Duration, Instant};

/// Compose buffer contents that switch to channel entry.
pub const CHANNEL_COMMAND: &str = "/channel";

/// Highest selectable channel index.
pub const MAX_CHANNEL: u8 = 9;

/// Which buffer keystrokes feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Compose,
    SetChannel,
}

/// Keyboard input, independent of the terminal backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
    Escape,
    /// Ctrl-C, or the display going away.
    Interrupt,
}

/// What the caller has to do after a key was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Send(String),
    EnterSetChannel,
    ChannelChanged(u8),
    ChannelRejected(String),
    Quit,
}

/// Blink state of the status indicator. With a zero interval it toggles
/// on every frame.
#[derive(Debug, Clone)]
pub struct Blink {
    visible: bool,
    last_toggle: Instant,
    interval: Duration,
}

impl Blink {
    pub fn new(interval: Duration) -> Blink {
        Blink {
            visible: true,
            last_toggle: Instant::now(),
            interval,
        }
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    /// Called once per frame.
    pub fn advance(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_toggle) >= self.interval {
            self.visible = !self.visible;
            self.last_toggle = now;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    message_input: String,
    channel_input: String,
    channel: u8,
    mode: InputMode,
    pub blink: Blink,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(Duration::ZERO)
    }
}

impl Session {
    pub fn new(blink_interval: Duration) -> Session {
        Session {
            message_input: String::new(),
            channel_input: String::new(),
            channel: 0,
            mode: InputMode::Compose,
            blink: Blink::new(blink_interval),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn message_input(&self) -> &str {
        &self.message_input
    }

    pub fn channel_input(&self) -> &str {
        &self.channel_input
    }

    /// The prompt line shown at the bottom of the display.
    pub fn input_line(&self) -> String {
        match self.mode {
            InputMode::Compose => format!("Send: {}", self.message_input),
            InputMode::SetChannel => format!("Set Channel: {}", self.channel_input),
        }
    }

    fn buffer(&mut self) -> &mut String {
        match self.mode {
            InputMode::Compose => &mut self.message_input,
            InputMode::SetChannel => &mut self.channel_input,
        }
    }

    pub fn handle_key(&mut self, key: Key) -> Action {
        match key {
            Key::Escape | Key::Interrupt => Action::Quit,
            Key::Char(c) => {
                if !c.is_control() {
                    self.buffer().push(c);
                }
                Action::None
            }
            Key::Backspace => {
                self.buffer().pop();
                Action::None
            }
            Key::Enter => match self.mode {
                InputMode::Compose => self.submit_message(),
                InputMode::SetChannel => self.submit_channel(),
            },
        }
    }

    fn submit_message(&mut self) -> Action {
        if self.message_input.trim() == CHANNEL_COMMAND {
            self.message_input.clear();
            self.mode = InputMode::SetChannel;
            Action::EnterSetChannel
        } else if self.message_input.is_empty() {
            Action::None
        } else {
            Action::Send(std::mem::take(&mut self.message_input))
        }
    }

    fn submit_channel(&mut self) -> Action {
        let input = std::mem::take(&mut self.channel_input);
        self.mode = InputMode::Compose;
        match input.trim().parse::<u8>() {
            Ok(n) if n <= MAX_CHANNEL => {
                self.channel = n;
                Action::ChannelChanged(n)
            }
            _ => Action::ChannelRejected(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_str(session: &mut Session, s: &str) {
        for c in s.chars() {
            assert_eq!(session.handle_key(Key::Char(c)), Action::None);
        }
    }

    fn enter_channel_mode(session: &mut Session) {
        type_str(session, CHANNEL_COMMAND);
        assert_eq!(session.handle_key(Key::Enter), Action::EnterSetChannel);
    }

    #[test]
    fn channel_command_switches_mode() {
        let mut s = Session::default();
        enter_channel_mode(&mut s);
        assert_eq!(s.mode(), InputMode::SetChannel);
        assert_eq!(s.message_input(), "");
        assert_eq!(s.input_line(), "Set Channel: ");
    }

    #[test]
    fn valid_channel_is_committed() {
        let mut s = Session::default();
        enter_channel_mode(&mut s);
        type_str(&mut s, "5");
        assert_eq!(s.handle_key(Key::Enter), Action::ChannelChanged(5));
        assert_eq!(s.channel(), 5);
        assert_eq!(s.mode(), InputMode::Compose);
        assert_eq!(s.channel_input(), "");
    }

    #[test]
    fn invalid_channels_are_rejected() {
        for bad in ["42", "abc", "", "-1"] {
            let mut s = Session::default();
            enter_channel_mode(&mut s);
            type_str(&mut s, "7");
            s.handle_key(Key::Enter);
            enter_channel_mode(&mut s);
            type_str(&mut s, bad);
            assert_eq!(s.handle_key(Key::Enter), Action::ChannelRejected(bad.into()));
            assert_eq!(s.channel(), 7);
            assert_eq!(s.mode(), InputMode::Compose);
            assert_eq!(s.channel_input(), "");
        }
    }

    #[test]
    fn backspace_edits_active_buffer() {
        let mut s = Session::default();
        type_str(&mut s, "hey");
        s.handle_key(Key::Backspace);
        assert_eq!(s.message_input(), "he");
        let mut s = Session::default();
        enter_channel_mode(&mut s);
        type_str(&mut s, "12");
        s.handle_key(Key::Backspace);
        assert_eq!(s.channel_input(), "1");
        s.handle_key(Key::Backspace);
        s.handle_key(Key::Backspace);
        assert_eq!(s.channel_input(), "");
    }

    #[test]
    fn enter_sends_and_clears() {
        let mut s = Session::default();
        assert_eq!(s.handle_key(Key::Enter), Action::None);
        type_str(&mut s, "hello");
        assert_eq!(s.handle_key(Key::Enter), Action::Send("hello".into()));
        assert_eq!(s.message_input(), "");
    }

    #[test]
    fn escape_quits_in_both_modes() {
        let mut s = Session::default();
        assert_eq!(s.handle_key(Key::Escape), Action::Quit);
        enter_channel_mode(&mut s);
        assert_eq!(s.handle_key(Key::Escape), Action::Quit);
        assert_eq!(s.handle_key(Key::Interrupt), Action::Quit);
    }

    #[test]
    fn control_characters_are_ignored() {
        let mut s = Session::default();
        s.handle_key(Key::Char('\t'));
        s.handle_key(Key::Char('x'));
        assert_eq!(s.message_input(), "x");
    }

    #[test]
    fn blink_toggles_every_frame_without_interval() {
        let mut b = Blink::new(Duration::ZERO);
        let now = Instant::now();
        b.advance(now);
        assert!(!b.visible());
        b.advance(now);
        assert!(b.visible());
    }

    #[test]
    fn blink_waits_for_interval() {
        let mut b = Blink::new(Duration::from_secs(3600));
        b.advance(Instant::now());
        assert!(b.visible());
    }
}
