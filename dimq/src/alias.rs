/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Topic alias handling for MQTT5 PUBLISH packets.

Inbound, every session keeps an [`InboundAliasResolver`] that binds aliases to topics as the peer
establishes them and fills in the topic of alias-only publishes.  Outbound, a session consults an
[`OutboundAliasResolver`] before encoding each PUBLISH.  Three outbound strategies ship with the
crate (never alias, honor caller-supplied aliases, and LRU auto-assignment); the trait allows
others to be plugged in through configuration.
*/

use crate::error::{DimqError, DimqResult};
use crate::mqtt::{PropertyIdentifier, PropertyValue, PublishPacket};

use log::*;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Outcome of an outbound alias decision for a single PUBLISH.
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutboundAliasResolution {

    /// The peer already knows the alias, so the topic can be sent empty
    pub skip_topic : bool,

    /// Alias to attach to the outgoing PUBLISH, if any
    pub alias : Option<u16>,
}

/// Strategy for choosing topic aliases on outgoing PUBLISH packets.
pub trait OutboundAliasResolver : Send {

    /// Called whenever a connection is (re)established.  `maximum_alias` is the peer's topic
    /// alias maximum; zero disables aliasing entirely.
    fn reset_for_new_connection(&mut self, maximum_alias : u16);

    /// Decides the alias for a publish to `topic`, recording the binding when a new one is made.
    /// `requested_alias` is whatever alias the caller placed on the packet.
    fn resolve_and_apply_topic_alias(&mut self, requested_alias: Option<u16>, topic: &str) -> OutboundAliasResolution;
}

type OutboundAliasResolverBox = Box<dyn OutboundAliasResolver + Send>;

/// Builds a fresh resolver; each session gets its own instance.
pub type OutboundAliasResolverFactoryFn = Arc<dyn Fn() -> OutboundAliasResolverBox + Send + Sync>;

/// Constructors for the bundled outbound alias strategies.
pub struct OutboundAliasResolverFactory {
}

impl OutboundAliasResolverFactory {

    /// Strategy that never aliases.  Caller-supplied aliases are stripped.
    pub fn new_null_factory() -> OutboundAliasResolverFactoryFn {
        Arc::new(|| { Box::new( NullOutboundAliasResolver {}) })
    }

    /// Strategy that only uses aliases the caller placed on the packet, and only when they fit
    /// within the peer's maximum.
    pub fn new_manual_factory() -> OutboundAliasResolverFactoryFn {
        Arc::new(|| { Box::new( ManualOutboundAliasResolver::new()) })
    }

    /// Strategy that assigns aliases automatically, recycling the least recently used binding
    /// once `maximum_alias` bindings exist.
    pub fn new_lru_factory(maximum_alias : u16) -> OutboundAliasResolverFactoryFn {
        Arc::new(move || { Box::new( LruOutboundAliasResolver::new(maximum_alias)) })
    }
}

/// Rewrites an outgoing publish according to an alias resolution: sets or strips the TopicAlias
/// property and empties the topic when the peer already holds the binding.
pub(crate) fn apply_outbound_alias_resolution(publish: &mut PublishPacket, resolution: &OutboundAliasResolution) -> DimqResult<()> {
    publish.properties.remove(PropertyIdentifier::TopicAlias);

    if let Some(alias) = resolution.alias {
        publish.properties.add(PropertyIdentifier::TopicAlias, PropertyValue::U16(alias))?;
        if resolution.skip_topic {
            publish.topic.clear();
        }
    }

    Ok(())
}

struct NullOutboundAliasResolver {
}

impl OutboundAliasResolver for NullOutboundAliasResolver {

    fn reset_for_new_connection(&mut self, _ : u16) {}

    fn resolve_and_apply_topic_alias(&mut self, _: Option<u16>, _: &str) -> OutboundAliasResolution {
        OutboundAliasResolution::default()
    }
}

struct ManualOutboundAliasResolver {
    maximum_alias : u16,

    bindings : HashMap<u16, String>,
}

impl ManualOutboundAliasResolver {

    fn new() -> ManualOutboundAliasResolver {
        ManualOutboundAliasResolver {
            maximum_alias: 0,
            bindings : HashMap::new(),
        }
    }
}

impl OutboundAliasResolver for ManualOutboundAliasResolver {

    fn reset_for_new_connection(&mut self, maximum_alias : u16) {
        self.maximum_alias = maximum_alias;
        self.bindings.clear();
    }

    fn resolve_and_apply_topic_alias(&mut self, requested_alias: Option<u16>, topic: &str) -> OutboundAliasResolution {
        let Some(alias) = requested_alias else {
            return OutboundAliasResolution::default();
        };

        if alias == 0 || alias > self.maximum_alias {
            debug!("Outbound alias {} is outside the peer's range (1..={}), sending full topic", alias, self.maximum_alias);
            return OutboundAliasResolution::default();
        }

        if self.bindings.get(&alias).map(|bound| bound == topic).unwrap_or(false) {
            return OutboundAliasResolution {
                skip_topic: true,
                alias: Some(alias),
            };
        }

        self.bindings.insert(alias, topic.to_string());

        OutboundAliasResolution {
            skip_topic: false,
            alias: Some(alias),
        }
    }
}

struct LruOutboundAliasResolver {
    configured_maximum : u16,
    negotiated_maximum : u16,

    cache : LruCache<String, u16>
}

impl LruOutboundAliasResolver {
    fn new(configured_maximum : u16) -> LruOutboundAliasResolver {
        let capacity = NonZeroUsize::new(configured_maximum as usize).unwrap_or(NonZeroUsize::MIN);

        LruOutboundAliasResolver {
            configured_maximum,
            negotiated_maximum: 0,
            cache : LruCache::new(capacity)
        }
    }
}

impl OutboundAliasResolver for LruOutboundAliasResolver {

    fn reset_for_new_connection(&mut self, maximum_alias : u16) {
        self.negotiated_maximum = u16::min(self.configured_maximum, maximum_alias);
        self.cache.clear();
    }

    fn resolve_and_apply_topic_alias(&mut self, _: Option<u16>, topic: &str) -> OutboundAliasResolution {
        if self.negotiated_maximum == 0 {
            return OutboundAliasResolution::default();
        }

        if let Some(alias) = self.cache.get(topic) {
            return OutboundAliasResolution {
                skip_topic: true,
                alias: Some(*alias),
            };
        }

        let alias =
            if self.cache.len() < self.negotiated_maximum as usize {
                (self.cache.len() + 1) as u16
            } else {
                match self.cache.pop_lru() {
                    Some((_, recycled_alias)) => { recycled_alias }
                    None => { return OutboundAliasResolution::default(); }
                }
            };

        self.cache.push(topic.to_string(), alias);

        OutboundAliasResolution {
            skip_topic: false,
            alias: Some(alias),
        }
    }
}

/// Tracks the aliases a peer has bound on this connection.
pub(crate) struct InboundAliasResolver {
    maximum_alias: u16,

    bindings : HashMap<u16, String>
}

impl InboundAliasResolver {
    pub(crate) fn new(maximum_alias: u16) -> InboundAliasResolver {
        InboundAliasResolver {
            maximum_alias,
            bindings : HashMap::new()
        }
    }

    /// Aliases never survive a connection, even when the session does.
    pub(crate) fn reset_for_new_connection(&mut self, maximum_alias: u16) {
        self.maximum_alias = maximum_alias;
        self.bindings.clear();
    }

    /// Fills in the topic of an alias-only publish, or records a new binding when both are present.
    pub(crate) fn resolve_publish_topic(&mut self, publish: &mut PublishPacket) -> DimqResult<()> {
        let Some(alias) = publish.topic_alias() else {
            return Ok(());
        };

        if alias == 0 || alias > self.maximum_alias {
            error!("Topic Alias Resolution - inbound alias {} outside of 1..={}", alias, self.maximum_alias);
            return Err(DimqError::new_inbound_topic_alias_not_valid("topic alias out of negotiated range"));
        }

        if publish.topic.is_empty() {
            return match self.bindings.get(&alias) {
                Some(topic) => {
                    publish.topic = topic.clone();
                    Ok(())
                }
                None => {
                    error!("Topic Alias Resolution - alias {} has no binding", alias);
                    Err(DimqError::new_inbound_topic_alias_not_valid("no binding exists for alias-only publish"))
                }
            };
        }

        self.bindings.insert(alias, publish.topic.clone());

        Ok(())
    }
}
