/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the immutable message representation shared between inflight queues, the
retained-message trie and session mailboxes.
 */

use crate::broker::persistence::PersistenceHook;
use crate::error::DimqResult;
use crate::logging::*;
use crate::mqtt::*;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of the client that published a message
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageOrigin {

    /// Client id of the publisher; `None` for messages injected by the embedding application
    pub client_id: Option<String>,

    /// Username the publisher authenticated with
    pub username: Option<String>,
}

/// A published application message.
///
/// Once built, a message is never modified.  Every queue or trie that holds it shares one
/// `Arc<MessageStore>`; when the last reference drops, the persistence hook (if any) is told the
/// message is gone.
pub struct MessageStore {
    topic: String,
    payload: Vec<u8>,
    qos: QualityOfService,
    retain: bool,
    properties: PropertyList,
    expiry: Option<Instant>,
    received_at: Instant,
    origin: MessageOrigin,
    store_id: Option<u64>,
    persistence: Option<Arc<dyn PersistenceHook>>,
}

fn strip_per_hop_properties(properties: &mut PropertyList) {
    properties.remove(PropertyIdentifier::TopicAlias);
    properties.remove(PropertyIdentifier::SubscriptionIdentifier);
    properties.remove(PropertyIdentifier::MessageExpiryInterval);
    properties.remove(PropertyIdentifier::WillDelayInterval);
}

impl MessageStore {

    /// Creates a message from its parts.  `expiry_interval_seconds` starts counting at `now`.
    pub fn new(topic: &str, payload: &[u8], qos: QualityOfService, retain: bool, properties: PropertyList, expiry_interval_seconds: Option<u32>, origin: MessageOrigin, now: Instant) -> MessageStore {
        let mut properties = properties;
        strip_per_hop_properties(&mut properties);

        MessageStore {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            properties,
            expiry: expiry_interval_seconds.map(|seconds| now + Duration::from_secs(seconds as u64)),
            received_at: now,
            origin,
            store_id: None,
            persistence: None,
        }
    }

    /// Captures an inbound publish.  The topic must already have been resolved from any alias.
    pub fn from_publish(publish: &PublishPacket, origin: MessageOrigin, now: Instant) -> MessageStore {
        MessageStore::new(&publish.topic, &publish.payload, publish.qos, publish.retain, publish.properties.clone(), publish.message_expiry_interval_seconds(), origin, now)
    }

    /// Captures a will message from a CONNECT
    pub fn from_will(will: &WillMessage, origin: MessageOrigin, now: Instant) -> MessageStore {
        let expiry = will.properties.get_u32(PropertyIdentifier::MessageExpiryInterval);
        MessageStore::new(&will.topic, &will.payload, will.qos, will.retain, will.properties.clone(), expiry, origin, now)
    }

    /// Wraps the message for sharing, registering it with the persistence hook first
    pub fn into_shared(mut self, persistence: Option<&Arc<dyn PersistenceHook>>) -> Arc<MessageStore> {
        if let Some(hook) = persistence {
            self.store_id = Some(hook.on_message_store(&self));
            self.persistence = Some(hook.clone());
        }

        Arc::new(self)
    }

    pub fn topic(&self) -> &str { &self.topic }

    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Quality of service the message was published with
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// Retain flag the message was published with
    pub fn retain(&self) -> bool { self.retain }

    pub fn properties(&self) -> &PropertyList { &self.properties }

    pub fn origin(&self) -> &MessageOrigin { &self.origin }

    pub fn received_at(&self) -> Instant { self.received_at }

    pub fn store_id(&self) -> Option<u64> { self.store_id }

    /// Whether the message's expiry interval has elapsed
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expiry {
            Some(expiry) => { now >= expiry }
            None => { false }
        }
    }

    /// Whole seconds left before expiry, rounded up so a live message never advertises zero
    pub fn remaining_expiry_seconds(&self, now: Instant) -> Option<u32> {
        self.expiry.map(|expiry| {
            let remaining = expiry.saturating_duration_since(now);
            let mut seconds = remaining.as_secs();
            if remaining.subsec_nanos() > 0 {
                seconds += 1;
            }

            seconds.min(u32::MAX as u64) as u32
        })
    }

    /// Builds the PUBLISH that delivers this message.  The forwarded expiry interval is reduced
    /// by the time the message has already spent inside the broker.
    pub fn to_publish_packet(&self, qos: QualityOfService, packet_id: u16, retain: bool, subscription_identifiers: &[u32], now: Instant) -> DimqResult<PublishPacket> {
        let mut properties = self.properties.clone();
        if let Some(remaining) = self.remaining_expiry_seconds(now) {
            properties.add(PropertyIdentifier::MessageExpiryInterval, PropertyValue::U32(remaining))?;
        }

        for identifier in subscription_identifiers {
            properties.add(PropertyIdentifier::SubscriptionIdentifier, PropertyValue::VarInt(*identifier))?;
        }

        Ok(PublishPacket {
            packet_id,
            topic: self.topic.clone(),
            qos,
            duplicate: false,
            retain,
            payload: self.payload.clone(),
            properties,
        })
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        if let (Some(hook), Some(store_id)) = (&self.persistence, self.store_id) {
            hook.on_message_delete(store_id);
        }
    }
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageStore {{")?;
        log_string!(self.topic, f, "topic");
        log_enum!(self.qos, f, "qos");
        log_primitive_value!(self.retain, f, "retain");
        log_binary_data!(self.payload, f, "payload");
        log_optional_string!(self.origin.client_id, f, "origin_client_id", value);
        if let Some(store_id) = self.store_id {
            log_primitive_value!(store_id, f, "store_id");
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::persistence::testing::TrackingPersistence;

    #[test]
    fn forwarded_expiry_shrinks_with_age() {
        let start = Instant::now();
        let mut publish = PublishPacket::new("alerts/fire", QualityOfService::AtLeastOnce, b"evacuate");
        publish.properties.add(PropertyIdentifier::MessageExpiryInterval, PropertyValue::U32(10)).unwrap();
        publish.properties.add(PropertyIdentifier::TopicAlias, PropertyValue::U16(2)).unwrap();

        let message = MessageStore::from_publish(&publish, MessageOrigin::default(), start);
        assert!(message.properties().get(PropertyIdentifier::TopicAlias).is_none());

        let forwarded = message.to_publish_packet(QualityOfService::AtLeastOnce, 7, false, &[3, 9], start + Duration::from_millis(4500)).unwrap();
        assert_eq!(Some(6), forwarded.message_expiry_interval_seconds());
        assert_eq!(2, forwarded.properties.get_all(PropertyIdentifier::SubscriptionIdentifier).count());
        assert_eq!(7, forwarded.packet_id);

        assert!(!message.is_expired(start + Duration::from_secs(9)));
        assert!(message.is_expired(start + Duration::from_secs(10)));
    }

    #[test]
    fn persistence_hook_sees_store_and_release() {
        let persistence = Arc::new(TrackingPersistence::default());
        let hook : Arc<dyn PersistenceHook> = persistence.clone();

        let message = MessageStore::new("a/b", b"1", QualityOfService::AtMostOnce, false, PropertyList::new(), None, MessageOrigin::default(), Instant::now());
        let shared = message.into_shared(Some(&hook));
        let second_reference = shared.clone();

        assert_eq!(1, persistence.live.lock().unwrap().len());
        drop(shared);
        assert_eq!(1, persistence.live.lock().unwrap().len());
        drop(second_reference);
        assert!(persistence.live.lock().unwrap().is_empty());
    }
}
