//! Routing topology: exchanges, queues and bindings.
//!
//! Entities are plain declarative descriptions. Declaring one on a
//! [`crate::Channel`] asks the transport to create it; the channel caches
//! what it declared so an identical re-declaration is free and a conflicting
//! one fails fast.

use crate::error::DeclarationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum entity name length (AMQP short string limit)
pub const MAX_NAME_LENGTH: usize = 255;

/// Exchange routing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    /// Deliver to queues whose binding key equals the routing key
    Direct,
    /// Deliver to every bound queue
    Fanout,
    /// Deliver to queues whose binding pattern matches the routing key
    Topic,
}

impl ExchangeType {
    /// Check whether a binding with `binding_key` accepts `routing_key`
    pub fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Direct => binding_key == routing_key,
            Self::Fanout => true,
            Self::Topic => topic_matches(binding_key, routing_key),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExchangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            other => Err(format!("unknown exchange type '{}'", other)),
        }
    }
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    topic_match_words(&pattern, &key)
}

fn topic_match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| topic_match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && topic_match_words(rest, &key[1..]),
        Some((word, rest)) => key
            .split_first()
            .map(|(first, key_rest)| first == word && topic_match_words(rest, key_rest))
            .unwrap_or(false),
    }
}

/// A named exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
}

impl Exchange {
    /// Durable direct exchange
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeType::Direct,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn with_kind(mut self, kind: ExchangeType) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    fn describe(&self) -> String {
        format!(
            "exchange(type={}, durable={}, auto_delete={})",
            self.kind, self.durable, self.auto_delete
        )
    }
}

/// A named queue, optionally bound to an exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub exchange: Option<Exchange>,
    pub routing_key: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl Queue {
    /// Durable, unbound queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchange: None,
            routing_key: String::new(),
            durable: true,
            auto_delete: false,
        }
    }

    /// Queue bound to an exchange with the same name and routing key, the
    /// topology a bare queue name stands for
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            exchange: Some(Exchange::new(name.clone())),
            routing_key: name.clone(),
            ..Self::new(name)
        }
    }

    pub fn bind_to(mut self, exchange: Exchange, routing_key: impl Into<String>) -> Self {
        self.exchange = Some(exchange);
        self.routing_key = routing_key.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Binding implied by this queue's exchange, if any
    pub fn binding(&self) -> Option<Binding> {
        self.exchange.as_ref().map(|exchange| Binding {
            exchange: exchange.name.clone(),
            queue: self.name.clone(),
            routing_key: self.routing_key.clone(),
        })
    }

    fn describe(&self) -> String {
        format!(
            "queue(durable={}, auto_delete={})",
            self.durable, self.auto_delete
        )
    }
}

impl From<&str> for Queue {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for Queue {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

/// Binding of a queue to an exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Any declarable entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Exchange(Exchange),
    Queue(Queue),
    Binding(Binding),
}

impl Entity {
    /// Name used in error messages and logs
    pub fn name(&self) -> String {
        match self {
            Self::Exchange(exchange) => exchange.name.clone(),
            Self::Queue(queue) => queue.name.clone(),
            Self::Binding(binding) => format!(
                "{}->{}[{}]",
                binding.exchange, binding.queue, binding.routing_key
            ),
        }
    }

    /// Key under which a channel caches the declaration
    pub(crate) fn cache_key(&self) -> EntityKey {
        match self {
            Self::Exchange(exchange) => EntityKey::Exchange(exchange.name.clone()),
            Self::Queue(queue) => EntityKey::Queue(queue.name.clone()),
            Self::Binding(binding) => EntityKey::Binding(binding.clone()),
        }
    }

    /// Validate names before anything reaches the transport
    pub fn validate(&self) -> Result<(), DeclarationError> {
        match self {
            Self::Exchange(exchange) => validate_name(&exchange.name),
            Self::Queue(queue) => {
                validate_name(&queue.name)?;
                if let Some(exchange) = &queue.exchange {
                    validate_name(&exchange.name)?;
                }
                Ok(())
            }
            Self::Binding(binding) => {
                validate_name(&binding.exchange)?;
                validate_name(&binding.queue)
            }
        }
    }

    /// Check that `requested` may share this declaration's name
    pub fn check_compatible(&self, requested: &Entity) -> Result<(), DeclarationError> {
        let conflict = |existing: String, wanted: String| DeclarationError::Conflict {
            name: requested.name(),
            existing,
            requested: wanted,
        };

        match (self, requested) {
            (Self::Exchange(a), Self::Exchange(b)) => {
                if a.kind != b.kind || a.durable != b.durable || a.auto_delete != b.auto_delete {
                    return Err(conflict(a.describe(), b.describe()));
                }
                Ok(())
            }
            (Self::Queue(a), Self::Queue(b)) => {
                if a.durable != b.durable || a.auto_delete != b.auto_delete {
                    return Err(conflict(a.describe(), b.describe()));
                }
                Ok(())
            }
            (Self::Binding(_), Self::Binding(_)) => Ok(()),
            (existing, _) => Err(conflict(
                format!("{:?}", existing.cache_key()),
                format!("{:?}", requested.cache_key()),
            )),
        }
    }
}

impl From<Exchange> for Entity {
    fn from(exchange: Exchange) -> Self {
        Self::Exchange(exchange)
    }
}

impl From<Queue> for Entity {
    fn from(queue: Queue) -> Self {
        Self::Queue(queue)
    }
}

impl From<Binding> for Entity {
    fn from(binding: Binding) -> Self {
        Self::Binding(binding)
    }
}

/// Cache key for declared entities
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum EntityKey {
    Exchange(String),
    Queue(String),
    Binding(Binding),
}

/// Validate an exchange or queue name
pub fn validate_name(name: &str) -> Result<(), DeclarationError> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(DeclarationError::InvalidName {
            name: name.to_string(),
            message: format!("must be 1-{} bytes", MAX_NAME_LENGTH),
        });
    }

    if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(DeclarationError::InvalidName {
            name: name.to_string(),
            message: "control characters and whitespace are not allowed".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
#[path = "entity_tests.rs"]
mod tests;
