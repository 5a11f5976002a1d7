//! Recent chatter in channels the bot was not addressed in.

use crate::host::ContextLine;
use dashmap::DashMap;
use std::collections::VecDeque;

/// Default number of lines kept per channel
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Bounded per-channel log of messages not directed at the bot.
///
/// Lines are handed to the host as context with the next addressed message
/// and then forgotten.
#[derive(Debug)]
pub struct ChannelHistory {
    limit: usize,
    channels: DashMap<String, VecDeque<ContextLine>>,
}

impl ChannelHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            channels: DashMap::new(),
        }
    }

    /// Remember a message, evicting the oldest once the channel is full
    pub fn record(&self, channel_id: &str, author: &str, content: &str) {
        if self.limit == 0 || content.trim().is_empty() {
            return;
        }
        let mut lines = self.channels.entry(channel_id.to_string()).or_default();
        while lines.len() >= self.limit {
            lines.pop_front();
        }
        lines.push_back(ContextLine {
            author: author.to_string(),
            content: content.to_string(),
        });
    }

    /// Remove and return everything recorded for a channel, oldest first
    pub fn take(&self, channel_id: &str) -> Vec<ContextLine> {
        self.channels
            .remove(channel_id)
            .map(|(_, lines)| lines.into())
            .unwrap_or_default()
    }

    /// Lines currently held for a channel
    pub fn len(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map_or(0, |lines| lines.len())
    }
}

impl Default for ChannelHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_take() {
        let history = ChannelHistory::default();
        history.record("c1", "ada", "first");
        history.record("c1", "bob", "second");
        history.record("c2", "eve", "elsewhere");

        let lines = history.take("c1");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].author, "ada");
        assert_eq!(lines[1].content, "second");

        assert!(history.take("c1").is_empty());
        assert_eq!(history.len("c2"), 1);
    }

    #[test]
    fn test_oldest_evicted_at_limit() {
        let history = ChannelHistory::new(3);
        for i in 0..5 {
            history.record("c", "u", &format!("m{}", i));
        }
        let contents: Vec<String> = history.take("c").into_iter().map(|l| l.content).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_blank_and_disabled() {
        let history = ChannelHistory::new(0);
        history.record("c", "u", "hi");
        assert_eq!(history.len("c"), 0);

        let history = ChannelHistory::default();
        history.record("c", "u", "   ");
        assert_eq!(history.len("c"), 0);
    }
}
