use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};

use super::errors::{BrokerError, Result};

/// Routing mode of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeMode {
    Direct,
    #[default]
    Topic,
    Fanout,
}

impl ExchangeMode {
    /// Whether a message published with `routing_key` reaches a queue bound
    /// with `pattern`.
    pub fn routes(self, pattern: &str, routing_key: &str) -> bool {
        match self {
            ExchangeMode::Direct => pattern == routing_key,
            ExchangeMode::Topic => topic_matches(pattern, routing_key),
            ExchangeMode::Fanout => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeMode::Direct => "direct",
            ExchangeMode::Topic => "topic",
            ExchangeMode::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for ExchangeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeMode> for ExchangeKind {
    fn from(mode: ExchangeMode) -> Self {
        match mode {
            ExchangeMode::Direct => ExchangeKind::Direct,
            ExchangeMode::Topic => ExchangeKind::Topic,
            ExchangeMode::Fanout => ExchangeKind::Fanout,
        }
    }
}

/// Exchange, queue and binding declared together when a broker handle is
/// built. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub mode: ExchangeMode,
    pub queue: String,
    /// Binding pattern, also the default routing key for publishing.
    pub binding: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl Topology {
    pub fn new(exchange: &str, mode: ExchangeMode, queue: &str, binding: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            mode,
            queue: queue.to_string(),
            binding: binding.to_string(),
            durable: true,
            auto_delete: false,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.is_empty() {
            return Err(BrokerError::topology("exchange", "name cannot be empty"));
        }
        if self.queue.is_empty() {
            return Err(BrokerError::topology("queue", "name cannot be empty"));
        }
        Ok(())
    }
}

/// AMQP topic matching: words are dot separated, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let key = words(routing_key);

    // reachable[i]: the pattern words so far can consume exactly key[..i]
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for word in words(pattern) {
        let mut next = vec![false; key.len() + 1];
        if word == "#" {
            let mut open = false;
            for (i, slot) in next.iter_mut().enumerate() {
                open |= reachable[i];
                *slot = open;
            }
        } else {
            for (i, &key_word) in key.iter().enumerate() {
                if reachable[i] && (word == "*" || word == key_word) {
                    next[i + 1] = true;
                }
            }
        }
        reachable = next;
    }
    reachable[key.len()]
}

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}
