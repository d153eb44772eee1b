use std::collections::HashSet;

use crate::transport::ExchangeDeclare;

/// A queue bound to an exchange under a routing pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

/// Represents an exchange in the in-memory broker.
///
/// Holds its declaration flags and the set of queue bindings. Routing
/// depends on the exchange kind: `topic` matches dotted patterns with
/// `*`/`#` wildcards, `direct` matches the routing key exactly and
/// `fanout` ignores it.
#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub declare: ExchangeDeclare,
    pub bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: &str, declare: ExchangeDeclare) -> Self {
        Self {
            name: name.to_string(),
            declare,
            bindings: Vec::new(),
        }
    }

    /// Binds a queue to the exchange. Binding twice has no effect.
    pub fn bind(&mut self, queue: &str, pattern: &str) {
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    /// Drops every binding of `queue`
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Queues that should receive a message published with `routing_key`,
    /// each listed once even when several bindings match.
    pub fn route(&self, routing_key: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .filter(|b| match self.declare.kind.as_str() {
                "fanout" => true,
                "direct" => b.pattern == routing_key,
                _ => topic_matches(&b.pattern, routing_key),
            })
            .filter(|b| seen.insert(b.queue.as_str()))
            .map(|b| b.queue.clone())
            .collect()
    }
}

/// AMQP topic matching: words are dot separated, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}
