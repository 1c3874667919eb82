//! Bindings and their match predicates.

use serde::Serialize;

use super::{ExchangeType, RoutingError};
use crate::protocol::{BasicPublish, FieldTable, QueueBind};

/// Routing rule linking one queue to one exchange.
///
/// Two bindings are equal when queue, exchange, routing key and arguments all
/// match. Exchanges rely on this to keep their binding list free of
/// duplicates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl Binding {
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments,
        }
    }

    #[must_use]
    pub fn from_bind(method: &QueueBind) -> Self {
        Self::new(
            method.queue.as_str(),
            method.exchange.as_str(),
            method.routing_key.as_str(),
            method.arguments.clone(),
        )
    }

    /// Byte-for-byte routing key equality.
    #[must_use]
    pub fn match_direct(&self, publish: &BasicPublish) -> bool {
        self.routing_key == publish.routing_key
    }

    /// Fanout bindings match every publish.
    #[must_use]
    pub fn match_fanout(&self, _publish: &BasicPublish) -> bool { true }

    /// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
    ///
    /// Cost is bounded by the product of pattern and key word counts, however
    /// many `#` words the pattern holds.
    #[must_use]
    pub fn match_topic(&self, publish: &BasicPublish) -> bool {
        let mut pattern: Vec<&str> = Vec::new();
        for word in self.routing_key.split('.') {
            // consecutive `#` words match the same thing as one
            if word == "#" && pattern.last() == Some(&"#") {
                continue;
            }
            pattern.push(word);
        }
        let words: Vec<&str> = publish.routing_key.split('.').collect();
        topic_match(&pattern, &words)
    }

    /// Headers matching is not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`RoutingError::NotImplemented`].
    pub fn match_headers(&self, _publish: &BasicPublish) -> Result<bool, RoutingError> {
        Err(RoutingError::NotImplemented(ExchangeType::Headers))
    }
}

// Runs in O(pattern x words): `reachable[j]` records whether the pattern
// words consumed so far can match the first `j` key words.
fn topic_match(pattern: &[&str], words: &[&str]) -> bool {
    let mut reachable = vec![false; words.len() + 1];
    reachable[0] = true;
    for &part in pattern {
        let mut next = vec![false; words.len() + 1];
        if part == "#" {
            let mut seen = false;
            for (slot, &here) in next.iter_mut().zip(&reachable) {
                seen |= here;
                *slot = seen;
            }
        } else {
            for (j, &word) in words.iter().enumerate() {
                next[j + 1] = reachable[j] && (part == "*" || part == word);
            }
        }
        reachable = next;
    }
    reachable[words.len()]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn publish(routing_key: &str) -> BasicPublish {
        BasicPublish {
            exchange: "ex".into(),
            routing_key: routing_key.into(),
            ..BasicPublish::default()
        }
    }

    fn binding(routing_key: &str) -> Binding {
        Binding::new("q", "ex", routing_key, FieldTable::new())
    }

    #[rstest]
    #[case("a.*.c", "a.b.c", true)]
    #[case("a.*.c", "a.b.b.c", false)]
    #[case("a.#", "a", true)]
    #[case("a.#", "a.b", true)]
    #[case("a.#", "a.b.c", true)]
    #[case("#", "", true)]
    #[case("#", "anything.at.all", true)]
    #[case("*", "a.b", false)]
    #[case("a.#.z", "a.z", true)]
    #[case("a.#.z", "a.b.c.z", true)]
    #[case("a.#.z", "a.b.c", false)]
    #[case("#.#.b", "b", true)]
    #[case("a.b", "a.b.c", false)]
    #[case("x.y", "x.y", true)]
    #[case("x.y", "x.z", false)]
    fn topic_patterns(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(binding(pattern).match_topic(&publish(key)), expected);
    }

    #[rstest]
    #[case::no_match(".c", false)]
    #[case::trailing_hash(".#", true)]
    fn interleaved_hashes_match_in_bounded_time(#[case] tail: &str, #[case] expected: bool) {
        let pattern = format!("{}{tail}", vec!["#.a"; 12].join("."));
        let key = vec!["a"; 40].join(".");
        let started = std::time::Instant::now();
        assert_eq!(binding(&pattern).match_topic(&publish(&key)), expected);
        assert!(
            started.elapsed() < std::time::Duration::from_millis(100),
            "matching took {:?}",
            started.elapsed()
        );
    }

    #[rstest]
    #[case("k", "k", true)]
    #[case("k", "K", false)]
    #[case("a.*", "a.b", false)]
    #[case("", "", true)]
    fn direct_is_exact(#[case] binding_key: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(binding(binding_key).match_direct(&publish(key)), expected);
    }

    #[test]
    fn fanout_ignores_routing_key() {
        assert!(binding("ignored").match_fanout(&publish("anything")));
    }

    #[test]
    fn headers_matching_is_not_implemented() {
        assert_eq!(
            binding("").match_headers(&publish("")),
            Err(RoutingError::NotImplemented(ExchangeType::Headers))
        );
    }

    #[test]
    fn equality_includes_arguments() {
        let plain = binding("k");
        let with_args = Binding::new("q", "ex", "k", FieldTable::new().with("x-match", "all"));
        assert_ne!(plain, with_args);
        assert_eq!(plain, binding("k"));
    }
}
