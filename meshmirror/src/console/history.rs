use std::collections::VecDeque;
use std::fmt;

/// Default number of entries a `MessageLog` keeps.
pub const DEFAULT_CAPACITY: usize = 256;

/// One sent or received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// `Channel n` for sent messages, the sender id for received ones.
    pub origin: String,
    pub text: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.text)
    }
}

/// Append-only message history, bounded by evicting the oldest entry.
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> MessageLog {
        MessageLog {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, origin: impl Into<String>, text: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            origin: origin.into(),
            text: text.into(),
        });
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        MessageLog::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_render_with_origin() {
        let mut log = MessageLog::default();
        log.push("Channel 3", "hello");
        assert_eq!(log.last().unwrap().to_string(), "Channel 3: hello");
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let mut log = MessageLog::new(2);
        log.push("a", "1");
        log.push("b", "2");
        log.push("c", "3");
        assert_eq!(log.len(), 2);
        let origins: Vec<_> = log.iter().map(|e| e.origin.as_str()).collect();
        assert_eq!(origins, ["b", "c"]);
    }
}
