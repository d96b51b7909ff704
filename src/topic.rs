//! Publish destinations and subscription patterns
//!
//! Topics are `/`-separated levels. Subscriptions may use two wildcards:
//!
//! - `*` as a whole level matches exactly one level; as the last character
//!   of a level (`orders*`) it matches one level starting with that prefix
//! - `>` as the final level matches one or more remaining levels

use crate::error::{ClientError, ClientResult};
use std::fmt;

/// Maximum encoded topic length in bytes
pub const MAX_TOPIC_LEN: usize = 250;

const SINGLE_LEVEL: &str = "*";
const MULTI_LEVEL: &str = ">";

/// Collapse empty levels and surrounding whitespace, keeping a leading `/`
fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let joined = trimmed
        .split('/')
        .filter(|level| !level.trim().is_empty())
        .collect::<Vec<_>>()
        .join("/");
    let joined = joined.trim_end();
    if trimmed.starts_with('/') && !joined.is_empty() {
        format!("/{joined}")
    } else {
        joined.to_string()
    }
}

fn check_common(raw: &str, normalized: &str) -> ClientResult<()> {
    if normalized.is_empty() {
        return Err(ClientError::invalid_topic(raw, "topic must not be empty"));
    }
    if normalized.len() > MAX_TOPIC_LEN {
        return Err(ClientError::invalid_topic(
            raw,
            format!("topic exceeds {MAX_TOPIC_LEN} bytes"),
        ));
    }
    if normalized.contains(['+', '#', '\0']) {
        return Err(ClientError::invalid_topic(
            raw,
            "'+', '#' and NUL are not allowed in topics",
        ));
    }
    Ok(())
}

/// Concrete publish destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn of(name: &str) -> ClientResult<Self> {
        let normalized = normalize(name);
        check_common(name, &normalized)?;
        if normalized.contains(['*', '>']) {
            return Err(ClientError::invalid_topic(
                name,
                "wildcards are only valid in subscriptions",
            ));
        }
        Ok(Topic(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Topic {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Topic::of(value)
    }
}

/// Subscription pattern, unique by its normalized form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicSubscription(String);

impl TopicSubscription {
    pub fn of(pattern: &str) -> ClientResult<Self> {
        let normalized = normalize(pattern);
        check_common(pattern, &normalized)?;

        let levels: Vec<&str> = normalized.split('/').collect();
        let last = levels.len() - 1;
        for (index, level) in levels.iter().enumerate() {
            if level.contains('>') && (*level != MULTI_LEVEL || index != last) {
                return Err(ClientError::invalid_topic(
                    pattern,
                    "'>' must be a whole level and the last one",
                ));
            }
            if let Some(position) = level.find('*') {
                if position != level.len() - 1 {
                    return Err(ClientError::invalid_topic(
                        pattern,
                        "'*' may only end a level",
                    ));
                }
            }
        }

        Ok(TopicSubscription(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_wildcards(&self) -> bool {
        self.0.contains(['*', '>'])
    }

    /// Whether a received destination falls under this pattern
    pub fn matches<T: AsRef<str>>(&self, topic: T) -> bool {
        let mut pattern = self.0.split('/').peekable();
        let mut levels = topic.as_ref().split('/');

        while let Some(expected) = pattern.next() {
            if expected == MULTI_LEVEL && pattern.peek().is_none() {
                return levels.next().is_some();
            }
            let Some(actual) = levels.next() else {
                return false;
            };
            let level_matches = match expected.strip_suffix(SINGLE_LEVEL) {
                Some(prefix) => actual.starts_with(prefix),
                None => expected == actual,
            };
            if !level_matches {
                return false;
            }
        }

        levels.next().is_none()
    }

    /// Equivalent MQTT filter; prefix levels widen to `+` and rely on
    /// [`TopicSubscription::matches`] for the final decision
    pub fn to_mqtt_filter(&self) -> String {
        self.0
            .split('/')
            .map(|level| {
                if level == MULTI_LEVEL {
                    "#"
                } else if level.ends_with(SINGLE_LEVEL) {
                    "+"
                } else {
                    level
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for TopicSubscription {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        TopicSubscription::of(value)
    }
}

impl From<&Topic> for TopicSubscription {
    fn from(topic: &Topic) -> Self {
        TopicSubscription(topic.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sub(pattern: &str) -> TopicSubscription {
        TopicSubscription::of(pattern).unwrap()
    }

    #[test]
    fn test_topic_normalization() {
        assert_eq!(Topic::of(" a//b/c/ ").unwrap().as_str(), "a/b/c");
        assert_eq!(Topic::of("/a//b").unwrap().as_str(), "/a/b");
    }

    #[test]
    fn test_topic_rejects_wildcards_and_empty() {
        assert!(Topic::of("a/*/c").is_err());
        assert!(Topic::of("a/>").is_err());
        assert!(Topic::of("a/+/c").is_err());
        assert!(Topic::of("").is_err());
        assert!(Topic::of("///").is_err());
    }

    #[test]
    fn test_topic_length_limit() {
        assert!(Topic::of(&"a".repeat(MAX_TOPIC_LEN)).is_ok());
        assert!(Topic::of(&"a".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }

    #[test]
    fn test_subscription_validation() {
        assert!(TopicSubscription::of("a/>").is_ok());
        assert!(TopicSubscription::of(">").is_ok());
        assert!(TopicSubscription::of("a/*/c").is_ok());
        assert!(TopicSubscription::of("a/ord*/c").is_ok());

        assert!(TopicSubscription::of("a/>/c").is_err());
        assert!(TopicSubscription::of("a/b>").is_err());
        assert!(TopicSubscription::of("a/*b").is_err());
        assert!(TopicSubscription::of("a/#").is_err());
    }

    #[test]
    fn test_duplicate_detection_uses_normalized_form() {
        assert_eq!(sub("a//b/"), sub("a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let pattern = sub("sales/*/orders");
        assert!(pattern.matches("sales/emea/orders"));
        assert!(!pattern.matches("sales/orders"));
        assert!(!pattern.matches("sales/emea/west/orders"));
    }

    #[test]
    fn test_prefix_wildcard() {
        let pattern = sub("sales/em*/orders");
        assert!(pattern.matches("sales/emea/orders"));
        assert!(pattern.matches("sales/em/orders"));
        assert!(!pattern.matches("sales/apac/orders"));
    }

    #[test]
    fn test_multi_level_wildcard_needs_one_level() {
        let pattern = sub("sales/>");
        assert!(pattern.matches("sales/emea"));
        assert!(pattern.matches("sales/emea/orders/42"));
        assert!(!pattern.matches("sales"));
        assert!(!pattern.matches("marketing/emea"));
    }

    #[test]
    fn test_exact_match() {
        let pattern = sub("try-me");
        assert!(pattern.matches("try-me"));
        assert!(!pattern.matches("try-me/too"));
        assert!(!pattern.matches(Topic::of("try-you").unwrap()));
    }

    #[test]
    fn test_mqtt_filter_translation() {
        assert_eq!(sub("a/*/c").to_mqtt_filter(), "a/+/c");
        assert_eq!(sub("a/pre*/c").to_mqtt_filter(), "a/+/c");
        assert_eq!(sub("a/b/>").to_mqtt_filter(), "a/b/#");
        assert_eq!(sub("a/b").to_mqtt_filter(), "a/b");
    }

    fn level() -> impl Strategy<Value = String> {
        "[a-z0-9_-]{1,8}"
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(raw in "[a-z/ ]{0,40}") {
            let once = normalize(&raw);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn prop_topic_matches_itself(levels in prop::collection::vec(level(), 1..6)) {
            let topic = Topic::of(&levels.join("/")).unwrap();
            prop_assert!(TopicSubscription::from(&topic).matches(&topic));
        }

        #[test]
        fn prop_root_multi_level_matches_everything(levels in prop::collection::vec(level(), 1..6)) {
            let topic = Topic::of(&levels.join("/")).unwrap();
            prop_assert!(sub(">").matches(&topic));
        }

        #[test]
        fn prop_star_replaces_any_single_level(
            levels in prop::collection::vec(level(), 1..6),
            index in 0usize..6,
        ) {
            let index = index % levels.len();
            let mut pattern = levels.clone();
            pattern[index] = "*".to_string();
            prop_assert!(sub(&pattern.join("/")).matches(levels.join("/")));
        }
    }
}
