/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::message::MessageStore;
use crate::topic::is_system_topic;

use log::*;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
struct RetainNode {
    children: BTreeMap<String, RetainNode>,
    message: Option<Arc<MessageStore>>,
}

impl RetainNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.message.is_none()
    }

    fn collect_all(&self, depth: usize, now: Instant, results: &mut Vec<Arc<MessageStore>>) {
        if let Some(message) = &self.message {
            if !message.is_expired(now) {
                results.push(message.clone());
            }
        }

        for (level, child) in self.children.iter() {
            if depth == 0 && is_system_topic(level) {
                continue;
            }

            child.collect_all(depth + 1, now, results);
        }
    }

    fn collect_matches(&self, levels: &[&str], depth: usize, now: Instant, results: &mut Vec<Arc<MessageStore>>) {
        let Some((level, rest)) = levels.split_first() else {
            if let Some(message) = &self.message {
                if !message.is_expired(now) {
                    results.push(message.clone());
                }
            }
            return;
        };

        match *level {
            "#" => {
                // the parent level matches too, except at the root
                if depth > 0 {
                    if let Some(message) = &self.message {
                        if !message.is_expired(now) {
                            results.push(message.clone());
                        }
                    }
                }

                for (child_level, child) in self.children.iter() {
                    if depth == 0 && is_system_topic(child_level) {
                        continue;
                    }

                    child.collect_all(depth + 1, now, results);
                }
            }
            "+" => {
                for (child_level, child) in self.children.iter() {
                    if depth == 0 && is_system_topic(child_level) {
                        continue;
                    }

                    child.collect_matches(rest, depth + 1, now, results);
                }
            }
            _ => {
                if let Some(child) = self.children.get(*level) {
                    child.collect_matches(rest, depth + 1, now, results);
                }
            }
        }
    }

    fn prune_expired(&mut self, now: Instant) -> usize {
        let mut pruned = 0;
        if self.message.as_ref().is_some_and(|message| message.is_expired(now)) {
            self.message = None;
            pruned += 1;
        }

        for child in self.children.values_mut() {
            pruned += child.prune_expired(now);
        }
        self.children.retain(|_, child| !child.is_empty());

        pruned
    }
}

/// Retained messages indexed by topic level, at most one per topic
#[derive(Default)]
pub struct RetainTrie {
    root: RetainNode,
    count: usize,
}

impl RetainTrie {

    pub fn new() -> RetainTrie {
        RetainTrie::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Stores a message as the retained message for its topic, replacing any previous one.  An
    /// empty payload removes the retained message instead.
    pub fn store(&mut self, message: Arc<MessageStore>) {
        if message.payload().is_empty() {
            self.clear(message.topic());
            return;
        }

        let mut node = &mut self.root;
        for level in message.topic().split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }

        debug!("RetainTrie store - retaining message on \"{}\"", message.topic());
        if node.message.replace(message).is_none() {
            self.count += 1;
        }
    }

    /// Removes the retained message for a topic, returning it
    pub fn clear(&mut self, topic: &str) -> Option<Arc<MessageStore>> {
        let levels : Vec<&str> = topic.split('/').collect();
        let removed = clear_recursive(&mut self.root, &levels);
        if removed.is_some() {
            self.count -= 1;
        }

        removed
    }

    /// Retained message for an exact topic
    pub fn get(&self, topic: &str) -> Option<Arc<MessageStore>> {
        let mut node = &self.root;
        for level in topic.split('/') {
            node = node.children.get(level)?;
        }

        node.message.clone()
    }

    /// Every unexpired retained message whose topic matches a (non-shared) filter
    pub fn match_filter(&self, filter: &str, now: Instant) -> Vec<Arc<MessageStore>> {
        let levels : Vec<&str> = filter.split('/').collect();
        let mut results = Vec::new();
        self.root.collect_matches(&levels, 0, now, &mut results);

        results
    }

    /// Drops expired retained messages, returning how many were removed
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let pruned = self.root.prune_expired(now);
        self.count -= pruned;
        pruned
    }
}

fn clear_recursive(node: &mut RetainNode, levels: &[&str]) -> Option<Arc<MessageStore>> {
    let Some((level, rest)) = levels.split_first() else {
        return node.message.take();
    };

    let child = node.children.get_mut(*level)?;
    let removed = clear_recursive(child, rest);
    if child.is_empty() {
        node.children.remove(*level);
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageOrigin;
    use crate::mqtt::*;

    use std::time::Duration;

    fn retained(topic: &str, payload: &[u8], expiry: Option<u32>, now: Instant) -> Arc<MessageStore> {
        MessageStore::new(topic, payload, QualityOfService::AtMostOnce, true, PropertyList::new(), expiry, MessageOrigin::default(), now).into_shared(None)
    }

    fn matched_topics(trie: &RetainTrie, filter: &str, now: Instant) -> Vec<String> {
        let mut topics : Vec<String> = trie.match_filter(filter, now).iter().map(|message| message.topic().to_string()).collect();
        topics.sort();
        topics
    }

    #[test]
    fn store_is_idempotent_and_empty_payload_clears() {
        let now = Instant::now();
        let mut trie = RetainTrie::new();

        trie.store(retained("home/kitchen/temp", b"20", None, now));
        trie.store(retained("home/kitchen/temp", b"21", None, now));
        assert_eq!(1, trie.len());
        assert_eq!(b"21", trie.get("home/kitchen/temp").unwrap().payload());

        trie.store(retained("home/kitchen/temp", b"", None, now));
        assert!(trie.is_empty());
        assert!(trie.get("home/kitchen/temp").is_none());
        assert!(trie.root.is_empty());
    }

    #[test]
    fn filter_lookup() {
        let now = Instant::now();
        let mut trie = RetainTrie::new();
        for topic in ["home", "home/kitchen/temp", "home/garage/temp", "home/garage/door", "$SYS/uptime"] {
            trie.store(retained(topic, b"x", None, now));
        }

        assert_eq!(vec!("home/garage/temp", "home/kitchen/temp"), matched_topics(&trie, "home/+/temp", now));
        assert_eq!(vec!("home", "home/garage/door", "home/garage/temp", "home/kitchen/temp"), matched_topics(&trie, "home/#", now));
        assert_eq!(vec!("home", "home/garage/door", "home/garage/temp", "home/kitchen/temp"), matched_topics(&trie, "#", now));
        assert_eq!(vec!("$SYS/uptime"), matched_topics(&trie, "$SYS/#", now));
        assert!(matched_topics(&trie, "+/uptime", now).is_empty());
    }

    #[test]
    fn expired_messages_hidden_then_pruned() {
        let now = Instant::now();
        let mut trie = RetainTrie::new();
        trie.store(retained("status/a", b"up", Some(5), now));
        trie.store(retained("status/b", b"up", None, now));

        let later = now + Duration::from_secs(6);
        assert_eq!(vec!("status/b"), matched_topics(&trie, "status/+", later));

        assert_eq!(1, trie.prune_expired(later));
        assert_eq!(1, trie.len());
        assert!(trie.get("status/a").is_none());
    }
}
