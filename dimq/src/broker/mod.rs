/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the state a broker shares between all of its connections.

A [`BrokerContext`] owns the session table, the subscription trie and the retained message trie.
Every [`BrokerSession`](crate::session::broker::BrokerSession) holds an `Arc` to it.  Sessions never
call each other: a message bound for another client is pushed onto that client's mailbox and is
picked up the next time the owning connection is serviced.

Nothing in the context runs on its own.  Delayed wills, session expiry and retained message expiry
advance only when the embedding application calls [`BrokerContext::service`].
 */

pub mod persistence;
pub mod security;

use crate::config::BrokerConfig;
use crate::error::{fold_dimq_result, DimqError, DimqResult};
use crate::inflight::{Delivery, InflightDirection, InflightQueue};
use crate::message::{MessageOrigin, MessageStore};
use crate::mqtt::*;
use crate::topic::retain::RetainTrie;
use crate::topic::split_shared_filter;
use crate::topic::subscription::{SubscriptionOptions, SubscriptionTrie};
use crate::{fold_optional_timepoint_min, fold_timepoint};

use self::persistence::PersistenceHook;
use self::security::{AclAccess, AuthDecision, AuthPlugin, ClientInfo, SecurityChain};

use log::*;
use rand::distributions::Alphanumeric;
use rand::Rng;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

const ASSIGNED_CLIENT_ID_SUFFIX_LENGTH : usize = 16;

fn lock_poisoned<T>(_: PoisonError<T>) -> DimqError {
    DimqError::new_internal_state_error("broker lock poisoned")
}

/// Session state that outlives the connection it was created on
#[derive(Debug)]
pub(crate) struct SessionStore {

    /// Connection currently attached to the session, if any
    pub(crate) owner: Option<u64>,
    pub(crate) inflight_in: InflightQueue,
    pub(crate) inflight_out: InflightQueue,
}

/// One client's session, shared between the session table and the attached connection
pub(crate) struct SessionSlot {
    mailbox: Mutex<VecDeque<Delivery>>,
    store: Mutex<SessionStore>,
}

impl SessionSlot {
    fn new(receive_maximum: u16) -> SessionSlot {
        SessionSlot {
            mailbox: Mutex::new(VecDeque::new()),
            store: Mutex::new(SessionStore {
                owner: None,
                inflight_in: InflightQueue::new(InflightDirection::Incoming, receive_maximum),
                inflight_out: InflightQueue::new(InflightDirection::Outgoing, u16::MAX),
            }),
        }
    }

    fn push_delivery(&self, delivery: Delivery) -> DimqResult<()> {
        self.mailbox.lock().map_err(lock_poisoned)?.push_back(delivery);
        Ok(())
    }

    /// Removes and returns everything waiting in the mailbox
    #[cfg(test)]
    pub(crate) fn take_deliveries(&self) -> DimqResult<Vec<Delivery>> {
        let mut mailbox = self.mailbox.lock().map_err(lock_poisoned)?;
        Ok(mailbox.drain(..).collect())
    }

    /// Removes the oldest delivery waiting in the mailbox
    pub(crate) fn pop_delivery(&self) -> DimqResult<Option<Delivery>> {
        Ok(self.mailbox.lock().map_err(lock_poisoned)?.pop_front())
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.mailbox.lock().map(|mailbox| mailbox.len()).unwrap_or(0)
    }

    /// Locks the session store on behalf of a connection.  Fails with `SessionTakenOver` once a
    /// newer connection has claimed the session.
    pub(crate) fn lock_for(&self, connection_id: u64) -> DimqResult<MutexGuard<'_, SessionStore>> {
        let store = self.store.lock().map_err(lock_poisoned)?;
        if store.owner != Some(connection_id) {
            return Err(DimqError::new_session_taken_over());
        }

        Ok(store)
    }

    fn revoke(&self, connection_id: Option<u64>) -> DimqResult<()> {
        let mut store = self.store.lock().map_err(lock_poisoned)?;
        if connection_id.is_none() || store.owner == connection_id {
            store.owner = None;
        }

        Ok(())
    }
}

/// What happens to a connection's will message when the connection ends
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WillDisposition {
    Publish,
    Discard,
}

/// Everything the session table needs from a successful CONNECT
pub(crate) struct SessionRequest {
    pub(crate) client: ClientInfo,
    pub(crate) clean_start: bool,
    pub(crate) session_expiry_interval: u32,
    pub(crate) will: Option<WillMessage>,
}

/// A connection's claim on a session
pub(crate) struct SessionAttachment {
    pub(crate) slot: Arc<SessionSlot>,
    pub(crate) session_present: bool,
}

struct PendingWill {
    will: WillMessage,
    client: ClientInfo,
    delay_seconds: u32,
    due: Option<Instant>,
}

struct SessionEntry {
    slot: Arc<SessionSlot>,
    client: ClientInfo,
    connection_id: Option<u64>,
    session_expiry_interval: u32,
    disconnected_at: Option<Instant>,
    will: Option<PendingWill>,
}

impl SessionEntry {
    fn expiry_timepoint(&self) -> Option<Instant> {
        if self.connection_id.is_some() || self.session_expiry_interval == u32::MAX {
            return None;
        }

        self.disconnected_at.map(|disconnected_at| disconnected_at + Duration::from_secs(self.session_expiry_interval as u64))
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expiry_timepoint().is_some_and(|expiry| expiry <= now)
    }
}

/// Shared broker state: sessions, subscriptions, retained messages and security.
///
/// `Send + Sync`; wrap it in an `Arc` and hand a clone to every broker session.  Run one context
/// per security domain when different listeners need different security chains.
pub struct BrokerContext {
    config: BrokerConfig,
    security: SecurityChain,
    persistence: Option<Arc<dyn PersistenceHook>>,
    subscriptions: RwLock<SubscriptionTrie>,
    retained: RwLock<RetainTrie>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_connection_id: AtomicU64,
}

impl BrokerContext {

    /// Creates a context with no plugins and no persistence hook
    pub fn new(config: BrokerConfig) -> Arc<BrokerContext> {
        BrokerContextBuilder::new(config).build()
    }

    pub fn builder(config: BrokerConfig) -> BrokerContextBuilder {
        BrokerContextBuilder::new(config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn security(&self) -> &SecurityChain {
        &self.security
    }

    /// The persistence hook for a message, if it is durable.  Only QoS 1/2 and retained messages
    /// are announced to the hook.
    pub(crate) fn persistence_for(&self, qos: QualityOfService, retain: bool) -> Option<&Arc<dyn PersistenceHook>> {
        if qos == QualityOfService::AtMostOnce && !retain {
            return None;
        }

        self.persistence.as_ref()
    }

    pub(crate) fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Builds a client id for a client that connected without one
    pub(crate) fn assign_client_id(&self) -> String {
        let suffix : String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ASSIGNED_CLIENT_ID_SUFFIX_LENGTH)
            .map(char::from)
            .collect();

        format!("{}{}", self.config.assigned_client_id_prefix, suffix)
    }

    /// Attaches a connection to the session for its client id, creating, resuming or replacing
    /// the session as the CONNECT requested.  A connection already attached to the session loses
    /// it; its next operation fails with `SessionTakenOver`.
    pub(crate) fn connect_session(&self, request: SessionRequest, connection_id: u64, now: Instant) -> DimqResult<SessionAttachment> {
        let client_id = request.client.client_id.clone();
        let mut wills_to_publish = Vec::new();
        let mut displaced_slot = None;
        let mut clear_subscriptions = false;

        let (slot, session_present) = {
            let mut sessions = self.sessions.lock().map_err(lock_poisoned)?;

            if sessions.get(&client_id).is_some_and(|entry| entry.is_expired(now)) {
                info!("BrokerContext connect_session - session for \"{}\" expired before it was resumed", client_id);
                if let Some(mut expired) = sessions.remove(&client_id) {
                    wills_to_publish.extend(expired.will.take());
                }
                clear_subscriptions = true;
            }

            let will = request.will.map(|will| {
                let delay_seconds = will.properties.get_u32(PropertyIdentifier::WillDelayInterval).unwrap_or(0);
                PendingWill {
                    will,
                    client: request.client.clone(),
                    delay_seconds,
                    due: None,
                }
            });

            match sessions.get_mut(&client_id) {
                Some(entry) => {
                    if let Some(previous_connection) = entry.connection_id {
                        info!("BrokerContext connect_session - connection {} takes over \"{}\" from connection {}", connection_id, client_id, previous_connection);
                        if request.clean_start {
                            wills_to_publish.extend(entry.will.take());
                        }
                    } else if entry.will.is_some() {
                        debug!("BrokerContext connect_session - cancelling delayed will for \"{}\"", client_id);
                    }

                    let session_present = !request.clean_start;
                    if request.clean_start {
                        displaced_slot = Some(entry.slot.clone());
                        entry.slot = Arc::new(SessionSlot::new(self.config.receive_maximum));
                        clear_subscriptions = true;
                    }

                    entry.client = request.client;
                    entry.connection_id = Some(connection_id);
                    entry.session_expiry_interval = request.session_expiry_interval;
                    entry.disconnected_at = None;
                    entry.will = will;

                    (entry.slot.clone(), session_present)
                }
                None => {
                    let slot = Arc::new(SessionSlot::new(self.config.receive_maximum));
                    sessions.insert(client_id.clone(), SessionEntry {
                        slot: slot.clone(),
                        client: request.client,
                        connection_id: Some(connection_id),
                        session_expiry_interval: request.session_expiry_interval,
                        disconnected_at: None,
                        will,
                    });

                    (slot, false)
                }
            }
        };

        if clear_subscriptions {
            let removed = self.subscriptions.write().map_err(lock_poisoned)?.remove_client(&client_id);
            debug!("BrokerContext connect_session - clean start removed {} subscriptions for \"{}\"", removed, client_id);
        }

        if let Some(displaced) = displaced_slot {
            displaced.revoke(None)?;
        }

        slot.store.lock().map_err(lock_poisoned)?.owner = Some(connection_id);

        info!("BrokerContext connect_session - client \"{}\" attached on connection {}, session present: {}", client_id, connection_id, session_present);

        let mut result = Ok(());
        for will in wills_to_publish {
            result = fold_dimq_result(result, self.publish_will(will, now).map(|_| ()));
        }
        result?;

        Ok(SessionAttachment {
            slot,
            session_present,
        })
    }

    /// Detaches a connection from its session.  Sessions with a zero expiry interval end here;
    /// everything else waits offline for a reconnect or for [`service`](Self::service) to expire
    /// it.  Calls from a connection that no longer owns the session are ignored.
    pub(crate) fn session_disconnected(&self, client_id: &str, connection_id: u64, disposition: WillDisposition, now: Instant) -> DimqResult<()> {
        let mut will_now = None;
        let slot;
        let mut ended = false;

        {
            let mut sessions = self.sessions.lock().map_err(lock_poisoned)?;
            let Some(entry) = sessions.get_mut(client_id) else {
                return Ok(());
            };

            if entry.connection_id != Some(connection_id) {
                debug!("BrokerContext session_disconnected - connection {} no longer owns \"{}\"", connection_id, client_id);
                return Ok(());
            }

            entry.connection_id = None;
            entry.disconnected_at = Some(now);
            slot = entry.slot.clone();

            match disposition {
                WillDisposition::Discard => {
                    entry.will = None;
                }
                WillDisposition::Publish => {
                    let publish_immediately = entry.will.as_ref().is_some_and(|will| will.delay_seconds == 0 || entry.session_expiry_interval == 0);
                    if publish_immediately {
                        will_now = entry.will.take();
                    } else if let Some(will) = entry.will.as_mut() {
                        let delay = will.delay_seconds.min(entry.session_expiry_interval);
                        will.due = Some(now + Duration::from_secs(delay as u64));
                        debug!("BrokerContext session_disconnected - will for \"{}\" delayed by {} seconds", client_id, delay);
                    }
                }
            }

            if entry.session_expiry_interval == 0 {
                sessions.remove(client_id);
                ended = true;
            }
        }

        slot.revoke(Some(connection_id))?;

        if ended {
            self.subscriptions.write().map_err(lock_poisoned)?.remove_client(client_id);
            info!("BrokerContext session_disconnected - session for \"{}\" ended with its connection", client_id);
        } else {
            info!("BrokerContext session_disconnected - session for \"{}\" is now offline", client_id);
        }

        if let Some(will) = will_now {
            self.publish_will(will, now)?;
        }

        Ok(())
    }

    /// Applies a session expiry interval carried by an MQTT5 DISCONNECT
    pub(crate) fn update_session_expiry(&self, client_id: &str, connection_id: u64, session_expiry_interval: u32) -> DimqResult<()> {
        let mut sessions = self.sessions.lock().map_err(lock_poisoned)?;
        if let Some(entry) = sessions.get_mut(client_id) {
            if entry.connection_id == Some(connection_id) {
                entry.session_expiry_interval = self.config.effective_session_expiry(session_expiry_interval);
            }
        }

        Ok(())
    }

    /// Ends a session outright, regardless of its expiry interval.  Its will is published
    /// immediately.
    pub(crate) fn remove_session(&self, client_id: &str, connection_id: u64, now: Instant) -> DimqResult<()> {
        let removed = {
            let mut sessions = self.sessions.lock().map_err(lock_poisoned)?;
            if sessions.get(client_id).is_some_and(|entry| entry.connection_id == Some(connection_id)) {
                sessions.remove(client_id)
            } else {
                None
            }
        };

        let Some(mut entry) = removed else {
            return Ok(());
        };

        entry.slot.revoke(Some(connection_id))?;
        self.subscriptions.write().map_err(lock_poisoned)?.remove_client(client_id);
        info!("BrokerContext remove_session - session for \"{}\" closed", client_id);

        if let Some(will) = entry.will.take() {
            self.publish_will(will, now)?;
        }

        Ok(())
    }

    fn publish_will(&self, will: PendingWill, now: Instant) -> DimqResult<usize> {
        if self.security.check_acl(&will.client, &will.will.topic, AclAccess::Write) != AuthDecision::Allow {
            warn!("BrokerContext publish_will - will for \"{}\" on \"{}\" not authorized", will.client.client_id, will.will.topic);
            return Ok(0);
        }

        let origin = MessageOrigin {
            client_id: Some(will.client.client_id.clone()),
            username: will.client.username.clone(),
        };

        info!("BrokerContext publish_will - publishing will of \"{}\" to \"{}\"", will.client.client_id, will.will.topic);
        let message = MessageStore::from_will(&will.will, origin, now).into_shared(self.persistence_for(will.will.qos, will.will.retain));
        self.publish(message, now)
    }

    /// Routes a message to every matching subscription and, if it is retained, stores it.
    /// Returns the number of deliveries queued.
    ///
    /// The embedding application may call this directly to inject messages, such as `$SYS`
    /// statistics, that no client published.
    pub fn publish(&self, message: Arc<MessageStore>, now: Instant) -> DimqResult<usize> {
        if message.is_expired(now) {
            debug!("BrokerContext publish - message on \"{}\" expired before routing", message.topic());
            return Ok(0);
        }

        if message.retain() && self.config.retain_available {
            self.retained.write().map_err(lock_poisoned)?.store(message.clone());
        }

        let matches = self.subscriptions.read().map_err(lock_poisoned)?.match_publish(message.topic());
        if matches.is_empty() {
            return Ok(0);
        }

        let targets : Vec<_> = {
            let sessions = self.sessions.lock().map_err(lock_poisoned)?;
            matches.into_iter().filter_map(|matched| {
                let entry = sessions.get(&matched.subscriber.client_id)?;
                Some((matched.subscriber, entry.slot.clone(), entry.client.clone(), entry.connection_id.is_some()))
            }).collect()
        };

        let mut delivered = 0;
        for (subscriber, slot, client, online) in targets {
            if subscriber.options.no_local && message.origin().client_id.as_deref() == Some(subscriber.client_id.as_str()) {
                continue;
            }

            if self.security.check_acl(&client, message.topic(), AclAccess::Read) != AuthDecision::Allow {
                debug!("BrokerContext publish - \"{}\" may not read \"{}\"", client.client_id, message.topic());
                continue;
            }

            let qos =
                if self.config.upgrade_outgoing_qos {
                    subscriber.qos
                } else {
                    message.qos().min(subscriber.qos)
                };

            if !online && qos == QualityOfService::AtMostOnce {
                debug!("BrokerContext publish - dropping QoS 0 message for offline client \"{}\"", subscriber.client_id);
                continue;
            }

            if slot.queued_len() >= self.config.maximum_queued_messages {
                warn!("BrokerContext publish - queue for \"{}\" is full, dropping message on \"{}\"", subscriber.client_id, message.topic());
                continue;
            }

            slot.push_delivery(Delivery {
                message: message.clone(),
                qos,
                retain: subscriber.options.retain_as_published && message.retain(),
                subscription_identifiers: subscriber.subscription_identifier.into_iter().collect(),
            })?;
            delivered += 1;
        }

        debug!("BrokerContext publish - message on \"{}\" queued for {} deliveries", message.topic(), delivered);
        Ok(delivered)
    }

    /// Adds or replaces a subscription.  Returns whether it is new.
    pub(crate) fn subscribe(&self, client_id: &str, filter: &str, qos: QualityOfService, options: SubscriptionOptions, subscription_identifier: Option<u32>) -> DimqResult<bool> {
        self.subscriptions.write().map_err(lock_poisoned)?.subscribe(client_id, filter, qos, options, subscription_identifier)
    }

    /// Removes a subscription.  Returns whether one existed.
    pub(crate) fn unsubscribe(&self, client_id: &str, filter: &str) -> DimqResult<bool> {
        self.subscriptions.write().map_err(lock_poisoned)?.unsubscribe(client_id, filter)
    }

    /// Retained messages to replay for a new subscription.  Shared subscriptions never receive
    /// retained messages.
    pub(crate) fn retained_for(&self, filter: &str, now: Instant) -> DimqResult<Vec<Arc<MessageStore>>> {
        if split_shared_filter(filter).is_some() {
            return Ok(Vec::new());
        }

        Ok(self.retained.read().map_err(lock_poisoned)?.match_filter(filter, now))
    }

    /// Publishes delayed wills that have come due, ends offline sessions whose expiry interval
    /// has elapsed (publishing any will they still hold) and drops expired retained messages.
    pub fn service(&self, now: Instant) -> DimqResult<()> {
        let mut wills = Vec::new();
        let mut expired = Vec::new();

        {
            let mut sessions = self.sessions.lock().map_err(lock_poisoned)?;
            for (client_id, entry) in sessions.iter_mut() {
                if entry.connection_id.is_some() {
                    continue;
                }

                let will_due = entry.will.as_ref().is_some_and(|will| will.due.is_some_and(|due| due <= now));
                if will_due || entry.is_expired(now) {
                    wills.extend(entry.will.take());
                }

                if entry.is_expired(now) {
                    expired.push(client_id.clone());
                }
            }

            for client_id in expired.iter() {
                info!("BrokerContext service - session for \"{}\" expired", client_id);
                sessions.remove(client_id);
            }
        }

        if !expired.is_empty() {
            let mut subscriptions = self.subscriptions.write().map_err(lock_poisoned)?;
            for client_id in expired.iter() {
                subscriptions.remove_client(client_id);
            }
        }

        let mut result = Ok(());
        for will in wills {
            result = fold_dimq_result(result, self.publish_will(will, now).map(|_| ()));
        }

        let pruned = self.retained.write().map_err(lock_poisoned)?.prune_expired(now);
        if pruned > 0 {
            debug!("BrokerContext service - pruned {} expired retained messages", pruned);
        }

        result
    }

    /// Earliest time at which [`service`](Self::service) has session or will work to do
    pub fn get_next_service_timepoint(&self) -> Option<Instant> {
        let sessions = self.sessions.lock().ok()?;

        let mut next_service_time = None;
        for entry in sessions.values() {
            if let Some(due) = entry.will.as_ref().and_then(|will| will.due) {
                next_service_time = fold_timepoint(&next_service_time, &due);
            }

            next_service_time = fold_optional_timepoint_min(&next_service_time, &entry.expiry_timepoint());
        }

        next_service_time
    }

    /// Number of sessions, online or offline
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    /// Whether a connection is currently attached to the client's session
    pub fn is_client_online(&self, client_id: &str) -> bool {
        self.sessions.lock().is_ok_and(|sessions| sessions.get(client_id).is_some_and(|entry| entry.connection_id.is_some()))
    }

    /// Number of deliveries waiting in a client's mailbox
    pub fn queued_message_count(&self, client_id: &str) -> usize {
        let slot = match self.sessions.lock() {
            Ok(sessions) => { sessions.get(client_id).map(|entry| entry.slot.clone()) }
            Err(_) => { None }
        };

        slot.map(|slot| slot.queued_len()).unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().map(|subscriptions| subscriptions.len()).unwrap_or(0)
    }

    pub fn retained_message_count(&self) -> usize {
        self.retained.read().map(|retained| retained.len()).unwrap_or(0)
    }

    /// The retained message for an exact topic
    pub fn retained_message(&self, topic: &str) -> Option<Arc<MessageStore>> {
        self.retained.read().ok()?.get(topic)
    }
}

/// A builder for broker contexts
pub struct BrokerContextBuilder {
    config: BrokerConfig,
    plugins: Vec<Arc<dyn AuthPlugin>>,
    persistence: Option<Arc<dyn PersistenceHook>>,
}

impl BrokerContextBuilder {

    /// Creates a new builder around a broker configuration
    pub fn new(config: BrokerConfig) -> Self {
        BrokerContextBuilder {
            config,
            plugins: Vec::new(),
            persistence: None,
        }
    }

    /// Appends a security plugin.  Plugins are consulted in the order they are added.
    pub fn with_auth_plugin(&mut self, plugin: Arc<dyn AuthPlugin>) -> &mut Self {
        self.plugins.push(plugin);
        self
    }

    /// Sets the hook told about message lifetimes
    pub fn with_persistence_hook(&mut self, hook: Arc<dyn PersistenceHook>) -> &mut Self {
        self.persistence = Some(hook);
        self
    }

    /// Builds a new shared broker context
    pub fn build(&self) -> Arc<BrokerContext> {
        let mut security = SecurityChain::new(&self.config);
        for plugin in self.plugins.iter() {
            security.add_plugin(plugin.clone());
        }

        Arc::new(BrokerContext {
            subscriptions: RwLock::new(SubscriptionTrie::new(self.config.shared_subscription_policy)),
            retained: RwLock::new(RetainTrie::new()),
            sessions: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            config: self.config.clone(),
            security,
            persistence: self.persistence.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::persistence::testing::TrackingPersistence;
    use crate::error::DimqError;

    use assert_matches::assert_matches;

    fn request(client_id: &str, clean_start: bool, session_expiry_interval: u32, will: Option<WillMessage>) -> SessionRequest {
        SessionRequest {
            client: ClientInfo {
                client_id: client_id.to_string(),
                username: None,
                protocol_version: ProtocolVersion::Mqtt5,
            },
            clean_start,
            session_expiry_interval,
            will,
        }
    }

    fn attach(context: &BrokerContext, client_id: &str, clean_start: bool, session_expiry_interval: u32, now: Instant) -> (u64, SessionAttachment) {
        let connection_id = context.allocate_connection_id();
        let attachment = context.connect_session(request(client_id, clean_start, session_expiry_interval, None), connection_id, now).unwrap();
        (connection_id, attachment)
    }

    fn message(topic: &str, payload: &[u8], qos: QualityOfService, retain: bool, publisher: Option<&str>, now: Instant) -> Arc<MessageStore> {
        let origin = MessageOrigin {
            client_id: publisher.map(|id| id.to_string()),
            username: None,
        };

        MessageStore::new(topic, payload, qos, retain, PropertyList::new(), None, origin, now).into_shared(None)
    }

    fn will(topic: &str, delay: Option<u32>) -> WillMessage {
        let mut will = WillMessage {
            topic: topic.to_string(),
            payload: b"gone".to_vec(),
            qos: QualityOfService::AtLeastOnce,
            retain: false,
            properties: PropertyList::new(),
        };

        if let Some(delay) = delay {
            will.properties.add(PropertyIdentifier::WillDelayInterval, PropertyValue::U32(delay)).unwrap();
        }

        will
    }

    #[test]
    fn offline_queue_limits() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::builder().with_maximum_queued_messages(2).build());

        let (connection_id, _) = attach(&context, "subscriber", false, 3600, now);
        context.subscribe("subscriber", "sensors/#", QualityOfService::ExactlyOnce, SubscriptionOptions::default(), None).unwrap();
        context.session_disconnected("subscriber", connection_id, WillDisposition::Discard, now).unwrap();
        assert!(!context.is_client_online("subscriber"));

        assert_eq!(0, context.publish(message("sensors/a", b"1", QualityOfService::AtMostOnce, false, None, now), now).unwrap());
        assert_eq!(1, context.publish(message("sensors/a", b"2", QualityOfService::AtLeastOnce, false, None, now), now).unwrap());
        assert_eq!(1, context.publish(message("sensors/b", b"3", QualityOfService::ExactlyOnce, false, None, now), now).unwrap());
        assert_eq!(0, context.publish(message("sensors/c", b"4", QualityOfService::AtLeastOnce, false, None, now), now).unwrap());

        assert_eq!(2, context.queued_message_count("subscriber"));
    }

    #[test]
    fn online_mailbox_limits() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::builder().with_maximum_queued_messages(2).build());

        let (_, attachment) = attach(&context, "subscriber", true, 0, now);
        context.subscribe("subscriber", "sensors/#", QualityOfService::AtLeastOnce, SubscriptionOptions::default(), None).unwrap();

        assert_eq!(1, context.publish(message("sensors/a", b"1", QualityOfService::AtMostOnce, false, None, now), now).unwrap());
        assert_eq!(1, context.publish(message("sensors/a", b"2", QualityOfService::AtLeastOnce, false, None, now), now).unwrap());
        assert_eq!(0, context.publish(message("sensors/a", b"3", QualityOfService::AtLeastOnce, false, None, now), now).unwrap());
        assert_eq!(2, context.queued_message_count("subscriber"));

        assert_matches!(attachment.slot.pop_delivery(), Ok(Some(delivery)) if delivery.message.payload() == b"1");
        assert_eq!(1, context.publish(message("sensors/a", b"4", QualityOfService::AtLeastOnce, false, None, now), now).unwrap());
    }

    #[test]
    fn routing_applies_subscription_options() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::default());
        let (_, attachment) = attach(&context, "client", true, 0, now);

        let no_local = SubscriptionOptions { no_local: true, ..Default::default() };
        let keep_retain = SubscriptionOptions { retain_as_published: true, ..Default::default() };
        context.subscribe("client", "chat/own", QualityOfService::AtLeastOnce, no_local, None).unwrap();
        context.subscribe("client", "chat/+", QualityOfService::AtMostOnce, keep_retain, Some(9)).unwrap();

        assert_eq!(1, context.publish(message("chat/own", b"hi", QualityOfService::ExactlyOnce, true, Some("client"), now), now).unwrap());

        let deliveries = attachment.slot.take_deliveries().unwrap();
        assert_eq!(1, deliveries.len());
        assert_eq!(QualityOfService::AtMostOnce, deliveries[0].qos);
        assert!(deliveries[0].retain);
        assert_eq!(vec!(9), deliveries[0].subscription_identifiers);
        assert_eq!(1, context.retained_message_count());
    }

    #[test]
    fn delayed_will_published_by_service() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::default());
        let (_, watcher) = attach(&context, "watcher", true, 0, now);
        context.subscribe("watcher", "status/#", QualityOfService::AtLeastOnce, SubscriptionOptions::default(), None).unwrap();

        let connection_id = context.allocate_connection_id();
        context.connect_session(request("device", false, 3600, Some(will("status/device", Some(10)))), connection_id, now).unwrap();
        context.session_disconnected("device", connection_id, WillDisposition::Publish, now).unwrap();

        assert_eq!(Some(now + Duration::from_secs(10)), context.get_next_service_timepoint());

        context.service(now + Duration::from_secs(5)).unwrap();
        assert!(watcher.slot.take_deliveries().unwrap().is_empty());

        context.service(now + Duration::from_secs(10)).unwrap();
        let deliveries = watcher.slot.take_deliveries().unwrap();
        assert_eq!(1, deliveries.len());
        assert_eq!("status/device", deliveries[0].message.topic());
    }

    #[test]
    fn reconnect_cancels_delayed_will() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::default());
        let (_, watcher) = attach(&context, "watcher", true, 0, now);
        context.subscribe("watcher", "status/#", QualityOfService::AtLeastOnce, SubscriptionOptions::default(), None).unwrap();

        let first = context.allocate_connection_id();
        context.connect_session(request("device", false, 3600, Some(will("status/device", Some(10)))), first, now).unwrap();
        context.session_disconnected("device", first, WillDisposition::Publish, now).unwrap();

        let (_, resumed) = attach(&context, "device", false, 3600, now + Duration::from_secs(3));
        assert!(resumed.session_present);

        context.service(now + Duration::from_secs(20)).unwrap();
        assert!(watcher.slot.take_deliveries().unwrap().is_empty());
    }

    #[test]
    fn normal_disconnect_discards_will() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::default());
        let (_, watcher) = attach(&context, "watcher", true, 0, now);
        context.subscribe("watcher", "status/#", QualityOfService::AtLeastOnce, SubscriptionOptions::default(), None).unwrap();

        let connection_id = context.allocate_connection_id();
        context.connect_session(request("device", true, 0, Some(will("status/device", None))), connection_id, now).unwrap();
        context.session_disconnected("device", connection_id, WillDisposition::Discard, now).unwrap();

        assert!(watcher.slot.take_deliveries().unwrap().is_empty());
        assert_eq!(1, context.session_count());
    }

    #[test]
    fn offline_session_expires() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::builder().with_session_expiry_cap(30).build());

        let (connection_id, _) = attach(&context, "device", false, context.config().effective_session_expiry(3600), now);
        context.subscribe("device", "commands/device", QualityOfService::AtLeastOnce, SubscriptionOptions::default(), None).unwrap();
        context.session_disconnected("device", connection_id, WillDisposition::Discard, now).unwrap();

        context.service(now + Duration::from_secs(29)).unwrap();
        assert_eq!(1, context.session_count());

        context.service(now + Duration::from_secs(30)).unwrap();
        assert_eq!(0, context.session_count());
        assert_eq!(0, context.subscription_count());
    }

    #[test]
    fn takeover_revokes_previous_connection() {
        let now = Instant::now();
        let context = BrokerContext::new(BrokerConfig::default());

        let (first, original) = attach(&context, "device", false, 3600, now);
        assert!(original.slot.lock_for(first).is_ok());

        let (second, resumed) = attach(&context, "device", false, 3600, now);
        assert!(resumed.session_present);
        assert!(Arc::ptr_eq(&original.slot, &resumed.slot));
        assert_matches!(original.slot.lock_for(first), Err(DimqError::SessionTakenOver(_)));
        assert!(resumed.slot.lock_for(second).is_ok());

        // the displaced connection noticing its loss must not detach the new one
        context.session_disconnected("device", first, WillDisposition::Publish, now).unwrap();
        assert!(context.is_client_online("device"));

        let (third, replaced) = attach(&context, "device", true, 0, now);
        assert!(!replaced.session_present);
        assert!(!Arc::ptr_eq(&resumed.slot, &replaced.slot));
        assert_matches!(resumed.slot.lock_for(second), Err(DimqError::SessionTakenOver(_)));
        assert!(replaced.slot.lock_for(third).is_ok());
    }

    #[test]
    fn persistence_hook_sees_release() {
        let now = Instant::now();
        let tracking = Arc::new(TrackingPersistence::default());
        let context = BrokerContext::builder(BrokerConfig::default())
            .with_persistence_hook(tracking.clone())
            .build();

        let (_, attachment) = attach(&context, "client", true, 0, now);
        context.subscribe("client", "jobs/+", QualityOfService::AtLeastOnce, SubscriptionOptions::default(), None).unwrap();

        let stored = MessageStore::new("jobs/1", b"work", QualityOfService::AtLeastOnce, false, PropertyList::new(), None, MessageOrigin::default(), now)
            .into_shared(context.persistence_for(QualityOfService::AtLeastOnce, false));
        context.publish(stored, now).unwrap();
        assert_eq!(1, tracking.live.lock().unwrap().len());

        drop(attachment.slot.take_deliveries().unwrap());
        assert!(tracking.live.lock().unwrap().is_empty());
    }

    #[test]
    fn only_durable_messages_are_persisted() {
        let context = BrokerContext::builder(BrokerConfig::default())
            .with_persistence_hook(Arc::new(TrackingPersistence::default()))
            .build();

        assert!(context.persistence_for(QualityOfService::AtMostOnce, false).is_none());
        assert!(context.persistence_for(QualityOfService::AtMostOnce, true).is_some());
        assert!(context.persistence_for(QualityOfService::AtLeastOnce, false).is_some());
        assert!(context.persistence_for(QualityOfService::ExactlyOnce, false).is_some());
    }
}
