//! Topic subscription registry for the hub.
//!
//! Tracks which clients are subscribed to which topics so broadcasts and
//! row changes can be fanned out. Subscriptions are ephemeral: they are
//! dropped when the client disconnects and lost on hub restart.

use std::collections::{BTreeSet, HashMap};

use classchat_proto::hub::Topic;
use classchat_proto::message::UserId;
use tokio::sync::RwLock;

/// Default maximum number of topics a single client may join.
const DEFAULT_MAX_TOPICS_PER_CLIENT: usize = 100;

/// Errors that can occur during subscription operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The client already holds the maximum number of subscriptions.
    #[error("subscription limit reached (max {0} topics per client)")]
    LimitReached(usize),
}

#[derive(Default)]
struct Registry {
    by_topic: HashMap<Topic, BTreeSet<UserId>>,
    by_client: HashMap<UserId, BTreeSet<Topic>>,
}

impl Registry {
    /// Removes `client` from the topic's subscriber set, dropping empty sets.
    fn detach(&mut self, client: &UserId, topic: &Topic) {
        let now_empty = self.by_topic.get_mut(topic).is_some_and(|subs| {
            subs.remove(client);
            subs.is_empty()
        });
        if now_empty {
            self.by_topic.remove(topic);
        }
    }
}

/// In-memory topic → subscribers index.
///
/// Thread-safe via [`RwLock`]. Both directions are indexed so that removing
/// a disconnected client is proportional to its own subscriptions.
pub struct TopicRegistry {
    inner: RwLock<Registry>,
    max_topics_per_client: usize,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    /// Creates an empty registry with the default per-client limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_topics(DEFAULT_MAX_TOPICS_PER_CLIENT)
    }

    /// Creates an empty registry with a custom per-client limit.
    #[must_use]
    pub fn with_max_topics(max_topics_per_client: usize) -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
            max_topics_per_client,
        }
    }

    /// Subscribes `client` to `topic`. Subscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError::LimitReached`] if the client already holds
    /// the maximum number of topics.
    pub async fn subscribe(&self, client: &UserId, topic: &Topic) -> Result<(), SubscribeError> {
        let mut guard = self.inner.write().await;
        let reg = &mut *guard;
        let topics = reg.by_client.entry(client.clone()).or_default();
        if topics.contains(topic) {
            return Ok(());
        }
        if topics.len() >= self.max_topics_per_client {
            return Err(SubscribeError::LimitReached(self.max_topics_per_client));
        }
        topics.insert(topic.clone());
        reg.by_topic
            .entry(topic.clone())
            .or_default()
            .insert(client.clone());
        drop(guard);
        Ok(())
    }

    /// Removes `client` from `topic`. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, client: &UserId, topic: &Topic) -> bool {
        let mut reg = self.inner.write().await;
        let removed = reg
            .by_client
            .get_mut(client)
            .is_some_and(|topics| topics.remove(topic));
        reg.detach(client, topic);
        drop(reg);
        removed
    }

    /// Drops every subscription held by `client`, returning how many there were.
    pub async fn remove_client(&self, client: &UserId) -> usize {
        let mut reg = self.inner.write().await;
        let Some(topics) = reg.by_client.remove(client) else {
            return 0;
        };
        for topic in &topics {
            reg.detach(client, topic);
        }
        drop(reg);
        topics.len()
    }

    /// Returns the current subscribers of a topic.
    pub async fn subscribers(&self, topic: &Topic) -> Vec<UserId> {
        let reg = self.inner.read().await;
        reg.by_topic
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `client` is subscribed to `topic`.
    pub async fn is_subscribed(&self, client: &UserId, topic: &Topic) -> bool {
        let reg = self.inner.read().await;
        reg.by_client
            .get(client)
            .is_some_and(|topics| topics.contains(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    #[tokio::test]
    async fn subscribe_and_list() {
        let registry = TopicRegistry::new();
        let topic = Topic::new("typing:a");
        registry.subscribe(&user("alice"), &topic).await.unwrap();
        registry.subscribe(&user("bob"), &topic).await.unwrap();

        assert_eq!(
            registry.subscribers(&topic).await,
            vec![user("alice"), user("bob")]
        );
        assert!(registry.is_subscribed(&user("alice"), &topic).await);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_noop() {
        let registry = TopicRegistry::with_max_topics(1);
        let topic = Topic::new("typing:a");
        registry.subscribe(&user("alice"), &topic).await.unwrap();
        registry.subscribe(&user("alice"), &topic).await.unwrap();
        assert_eq!(registry.subscribers(&topic).await.len(), 1);
    }

    #[tokio::test]
    async fn limit_per_client_enforced() {
        let registry = TopicRegistry::with_max_topics(2);
        registry
            .subscribe(&user("alice"), &Topic::new("t1"))
            .await
            .unwrap();
        registry
            .subscribe(&user("alice"), &Topic::new("t2"))
            .await
            .unwrap();
        let result = registry.subscribe(&user("alice"), &Topic::new("t3")).await;
        assert_eq!(result, Err(SubscribeError::LimitReached(2)));

        // Other clients are unaffected.
        registry
            .subscribe(&user("bob"), &Topic::new("t3"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_removes_empty_topic() {
        let registry = TopicRegistry::new();
        let topic = Topic::new("thread:x");
        registry.subscribe(&user("alice"), &topic).await.unwrap();
        assert!(registry.unsubscribe(&user("alice"), &topic).await);
        assert!(!registry.unsubscribe(&user("alice"), &topic).await);
        assert!(registry.subscribers(&topic).await.is_empty());
    }

    #[tokio::test]
    async fn remove_client_drops_all_subscriptions() {
        let registry = TopicRegistry::new();
        let t1 = Topic::new("t1");
        let t2 = Topic::new("t2");
        registry.subscribe(&user("alice"), &t1).await.unwrap();
        registry.subscribe(&user("alice"), &t2).await.unwrap();
        registry.subscribe(&user("bob"), &t2).await.unwrap();

        assert_eq!(registry.remove_client(&user("alice")).await, 2);
        assert!(registry.subscribers(&t1).await.is_empty());
        assert_eq!(registry.subscribers(&t2).await, vec![user("bob")]);
        assert_eq!(registry.remove_client(&user("alice")).await, 0);
    }
}
