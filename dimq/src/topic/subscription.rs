/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the subscription trie used to fan a publish out to every matching subscriber.

Each trie level is keyed by one topic level (`+` and `#` are stored as ordinary keys).  Matching
walks the exact, `+` and `#` children of each node at the same time, so one publish visits at
most three branches per level.
 */

use crate::config::SharedSubscriptionPolicy;
use crate::error::DimqResult;
use crate::mqtt::*;
use crate::topic::*;

use rand::Rng;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-subscription options carried by SUBSCRIBE
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SubscriptionOptions {

    /// Do not deliver messages published by the subscribing client itself
    pub no_local: bool,

    /// Keep the publisher's retain flag on forwarded messages
    pub retain_as_published: bool,

    /// When retained messages are sent in response to this subscription
    pub retain_handling: RetainHandlingType,
}

impl SubscriptionOptions {

    /// Extracts the options from a SUBSCRIBE entry
    pub fn from_subscription(subscription: &Subscription) -> SubscriptionOptions {
        SubscriptionOptions {
            no_local: subscription.no_local,
            retain_as_published: subscription.retain_as_published,
            retain_handling: subscription.retain_handling_type,
        }
    }
}

/// One client's subscription to one filter
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscriber {
    pub client_id: String,

    /// Maximum quality of service granted to the subscription
    pub qos: QualityOfService,
    pub options: SubscriptionOptions,
    pub subscription_identifier: Option<u32>,
}

/// A subscription selected for a publish
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionMatch {
    pub subscriber: Subscriber,

    /// Name of the shared subscription group the subscriber was chosen from
    pub shared_group: Option<String>,
}

#[derive(Default)]
struct SharedGroup {
    members: Vec<Subscriber>,
    cursor: AtomicUsize,
}

impl SharedGroup {
    fn pick(&self, policy: SharedSubscriptionPolicy) -> Option<&Subscriber> {
        if self.members.is_empty() {
            return None;
        }

        let index = match policy {
            SharedSubscriptionPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len()
            }
            SharedSubscriptionPolicy::Random => {
                rand::thread_rng().gen_range(0..self.members.len())
            }
        };

        self.members.get(index)
    }
}

#[derive(Default)]
struct SubscriptionNode {
    children: BTreeMap<String, SubscriptionNode>,
    subscribers: Vec<Subscriber>,
    shared: BTreeMap<String, SharedGroup>,
}

impl SubscriptionNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty() && self.shared.is_empty()
    }

    fn remove_subscriber(&mut self, client_id: &str, group: Option<&str>) -> bool {
        match group {
            Some(group_name) => {
                let Some(group) = self.shared.get_mut(group_name) else {
                    return false;
                };

                let before = group.members.len();
                group.members.retain(|member| member.client_id != client_id);
                let removed = group.members.len() != before;

                if group.members.is_empty() {
                    self.shared.remove(group_name);
                }

                removed
            }
            None => {
                let before = self.subscribers.len();
                self.subscribers.retain(|subscriber| subscriber.client_id != client_id);
                self.subscribers.len() != before
            }
        }
    }

    fn remove_client_recursive(&mut self, client_id: &str) -> usize {
        let mut removed = 0;

        let before = self.subscribers.len();
        self.subscribers.retain(|subscriber| subscriber.client_id != client_id);
        removed += before - self.subscribers.len();

        for group in self.shared.values_mut() {
            let before = group.members.len();
            group.members.retain(|member| member.client_id != client_id);
            removed += before - group.members.len();
        }
        self.shared.retain(|_, group| !group.members.is_empty());

        for child in self.children.values_mut() {
            removed += child.remove_client_recursive(client_id);
        }
        self.children.retain(|_, child| !child.is_empty());

        removed
    }

    fn collect_node(&self, policy: SharedSubscriptionPolicy, matches: &mut Vec<SubscriptionMatch>) {
        for subscriber in self.subscribers.iter() {
            matches.push(SubscriptionMatch {
                subscriber: subscriber.clone(),
                shared_group: None,
            });
        }

        for (group_name, group) in self.shared.iter() {
            if let Some(member) = group.pick(policy) {
                matches.push(SubscriptionMatch {
                    subscriber: member.clone(),
                    shared_group: Some(group_name.clone()),
                });
            }
        }
    }

    fn collect_matches(&self, levels: &[&str], depth: usize, policy: SharedSubscriptionPolicy, matches: &mut Vec<SubscriptionMatch>) {
        let Some((level, rest)) = levels.split_first() else {
            self.collect_node(policy, matches);

            // "a/#" also matches "a"
            if let Some(multi) = self.children.get("#") {
                multi.collect_node(policy, matches);
            }
            return;
        };

        if let Some(exact) = self.children.get(*level) {
            exact.collect_matches(rest, depth + 1, policy, matches);
        }

        if depth == 0 && is_system_topic(level) {
            return;
        }

        if let Some(single) = self.children.get("+") {
            single.collect_matches(rest, depth + 1, policy, matches);
        }

        if let Some(multi) = self.children.get("#") {
            multi.collect_node(policy, matches);
        }
    }
}

/// Index of every subscription held by a broker
pub struct SubscriptionTrie {
    root: SubscriptionNode,
    policy: SharedSubscriptionPolicy,
    count: usize,
}

impl SubscriptionTrie {

    pub fn new(policy: SharedSubscriptionPolicy) -> SubscriptionTrie {
        SubscriptionTrie {
            root: SubscriptionNode::default(),
            policy,
            count: 0,
        }
    }

    /// Number of subscriptions stored, shared group members included
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds or replaces a client's subscription to `filter`.  Returns true when the client had
    /// no subscription to this filter before.
    pub fn subscribe(&mut self, client_id: &str, filter: &str, qos: QualityOfService, options: SubscriptionOptions, subscription_identifier: Option<u32>) -> DimqResult<bool> {
        validate_topic_filter(filter)?;

        let (group, topic_filter) = match split_shared_filter(filter) {
            Some((group, inner)) => { (Some(group), inner) }
            None => { (None, filter) }
        };

        let mut node = &mut self.root;
        for level in topic_filter.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }

        let subscriber = Subscriber {
            client_id: client_id.to_string(),
            qos,
            options,
            subscription_identifier,
        };

        let members = match group {
            Some(group_name) => { &mut node.shared.entry(group_name.to_string()).or_default().members }
            None => { &mut node.subscribers }
        };

        if let Some(existing) = members.iter_mut().find(|member| member.client_id == client_id) {
            *existing = subscriber;
            return Ok(false);
        }

        members.push(subscriber);
        self.count += 1;
        Ok(true)
    }

    /// Removes a client's subscription to `filter`, pruning nodes left empty.  Returns whether a
    /// subscription existed.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) -> DimqResult<bool> {
        validate_topic_filter(filter)?;

        let (group, topic_filter) = match split_shared_filter(filter) {
            Some((group, inner)) => { (Some(group), inner) }
            None => { (None, filter) }
        };

        let levels : Vec<&str> = topic_filter.split('/').collect();
        let removed = unsubscribe_recursive(&mut self.root, &levels, client_id, group);
        if removed {
            self.count -= 1;
        }

        Ok(removed)
    }

    /// Removes every subscription held by a client
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let removed = self.root.remove_client_recursive(client_id);
        self.count -= removed;
        removed
    }

    /// Collects every subscription matching a topic name.  A client with several overlapping
    /// subscriptions appears once per subscription; each shared group contributes one member.
    pub fn match_publish(&self, topic: &str) -> Vec<SubscriptionMatch> {
        let levels : Vec<&str> = topic.split('/').collect();
        let mut matches = Vec::new();
        self.root.collect_matches(&levels, 0, self.policy, &mut matches);

        matches
    }
}

fn unsubscribe_recursive(node: &mut SubscriptionNode, levels: &[&str], client_id: &str, group: Option<&str>) -> bool {
    let Some((level, rest)) = levels.split_first() else {
        return node.remove_subscriber(client_id, group);
    };

    let Some(child) = node.children.get_mut(*level) else {
        return false;
    };

    let removed = unsubscribe_recursive(child, rest, client_id, group);
    if child.is_empty() {
        node.children.remove(*level);
    }

    removed
}
