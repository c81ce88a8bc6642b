/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::broker::BrokerContext;
use crate::broker::security::*;
use crate::config::*;
use crate::mqtt::*;
use crate::session::{PublishCompletion, SessionState};
use crate::testing::*;

use assert_matches::assert_matches;

use std::sync::Arc;
use std::time::Instant;

fn options(client_id: &str) -> ConnectOptionsBuilder {
    let mut builder = ConnectOptions::builder();
    builder.with_client_id(client_id);
    builder
}

fn persistent_options(client_id: &str) -> ConnectOptions {
    options(client_id).with_session_expiry_interval_seconds(300).build()
}

fn subscribe(link: &mut Link, filter: &str, qos: QualityOfService, now: Instant) -> SubackPacket {
    let packet = SubscribePacket {
        subscriptions: vec!(Subscription::new(filter, qos)),
        ..Default::default()
    };

    link.client.subscribe(packet, now).unwrap();
    link.pump(now);

    let suback = link.client_events.take().into_iter().find_map(|event| {
        match event {
            Event::Subscribe(suback) => { Some(suback) }
            _ => { None }
        }
    });

    suback.expect("no SUBACK received")
}

fn completions(events: Vec<Event>) -> Vec<(u16, PublishCompletion)> {
    events.into_iter().filter_map(|event| {
        match event {
            Event::PublishComplete(packet_id, completion) => { Some((packet_id, completion)) }
            _ => { None }
        }
    }).collect()
}

#[test]
fn connect_and_exchange_messages() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut subscriber = Link::connect(&context, options("sub").build(), now);
    assert_eq!(SessionState::Active, subscriber.client.state());
    assert_eq!(vec!(Event::Connect("sub".to_string(), false)), subscriber.client_events.take());
    assert!(context.is_client_online("sub"));

    let suback = subscribe(&mut subscriber, "sensors/+/temperature", QualityOfService::AtLeastOnce, now);
    assert_eq!(vec!(SubackReasonCode::GrantedQos1), suback.reason_codes);

    let mut publisher = Link::connect(&context, options("pub").build(), now);
    let packet_id = publisher.client.publish(PublishPacket::new("sensors/kitchen/temperature", QualityOfService::AtLeastOnce, b"21.5"), now).unwrap();
    publisher.pump(now);
    assert_eq!(vec!((packet_id, PublishCompletion::Puback(PubackReasonCode::Success))), completions(publisher.client_events.take()));

    subscriber.pump(now);
    let messages = subscriber.client_events.take_messages();
    assert_matches!(messages.as_slice(), [message] if message.topic == "sensors/kitchen/temperature" && message.payload == b"21.5" && message.qos == QualityOfService::AtLeastOnce);
}

#[test]
fn wildcard_fan_out() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut single_level = Link::connect(&context, options("single").build(), now);
    subscribe(&mut single_level, "a/+/c", QualityOfService::AtMostOnce, now);
    let mut multi_level = Link::connect(&context, options("multi").build(), now);
    subscribe(&mut multi_level, "a/#", QualityOfService::AtMostOnce, now);
    let mut unrelated = Link::connect(&context, options("unrelated").build(), now);
    subscribe(&mut unrelated, "x/y", QualityOfService::AtMostOnce, now);

    let mut publisher = Link::connect(&context, options("pub").build(), now);
    publisher.client.publish(PublishPacket::new("a/b/c", QualityOfService::AtMostOnce, b"hello"), now).unwrap();
    publisher.pump(now);

    single_level.pump(now);
    multi_level.pump(now);
    unrelated.pump(now);

    assert_eq!(1, single_level.client_events.take_messages().len());
    assert_eq!(1, multi_level.client_events.take_messages().len());
    assert!(unrelated.client_events.take_messages().is_empty());
}

#[test]
fn qos2_exactly_once_when_connection_drops_before_pubrec() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut subscriber = Link::connect(&context, options("sub").build(), now);
    subscribe(&mut subscriber, "orders/#", QualityOfService::ExactlyOnce, now);

    let mut publisher = Link::connect(&context, persistent_options("pub"), now);
    publisher.client_events.take();

    let packet_id = publisher.client.publish(PublishPacket::new("orders/42", QualityOfService::ExactlyOnce, b"ship"), now).unwrap();
    publisher.client_to_broker(now).unwrap();
    publisher.drop_connection(now);

    subscriber.pump(now);
    assert!(subscriber.client_events.take_messages().is_empty());

    publisher.reconnect(now);
    let events = publisher.client_events.take();
    assert!(events.contains(&Event::Connect("pub".to_string(), true)));
    assert_eq!(vec!((packet_id, PublishCompletion::Pubcomp(PubcompReasonCode::Success))), completions(events));

    subscriber.pump(now);
    let messages = subscriber.client_events.take_messages();
    assert_matches!(messages.as_slice(), [message] if message.payload == b"ship" && message.qos == QualityOfService::ExactlyOnce);
}

#[test]
fn qos2_exactly_once_when_connection_drops_after_pubrec() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut subscriber = Link::connect(&context, options("sub").build(), now);
    subscribe(&mut subscriber, "orders/#", QualityOfService::ExactlyOnce, now);

    let mut publisher = Link::connect(&context, persistent_options("pub"), now);
    publisher.client_events.take();

    let packet_id = publisher.client.publish(PublishPacket::new("orders/44", QualityOfService::ExactlyOnce, b"pack"), now).unwrap();
    publisher.client_to_broker(now).unwrap();
    publisher.broker_to_client(now).unwrap();
    publisher.drop_connection(now);

    subscriber.pump(now);
    assert!(subscriber.client_events.take_messages().is_empty());

    publisher.reconnect(now);
    let events = publisher.client_events.take();
    assert_eq!(vec!((packet_id, PublishCompletion::Pubcomp(PubcompReasonCode::Success))), completions(events));
    assert!(publisher.client.outgoing_inflight().is_empty());

    subscriber.pump(now);
    let messages = subscriber.client_events.take_messages();
    assert_matches!(messages.as_slice(), [message] if message.payload == b"pack" && message.qos == QualityOfService::ExactlyOnce);
}

#[test]
fn qos2_exactly_once_when_connection_drops_after_pubrel() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut subscriber = Link::connect(&context, options("sub").build(), now);
    subscribe(&mut subscriber, "orders/#", QualityOfService::ExactlyOnce, now);

    let mut publisher = Link::connect(&context, persistent_options("pub"), now);
    publisher.client_events.take();

    let packet_id = publisher.client.publish(PublishPacket::new("orders/43", QualityOfService::ExactlyOnce, b"bill"), now).unwrap();
    publisher.client_to_broker(now).unwrap();
    publisher.broker_to_client(now).unwrap();
    publisher.client_to_broker(now).unwrap();
    publisher.drop_connection(now);

    publisher.reconnect(now);
    let events = publisher.client_events.take();
    assert_eq!(vec!((packet_id, PublishCompletion::Pubcomp(PubcompReasonCode::PacketIdentifierNotFound))), completions(events));

    subscriber.pump(now);
    assert_eq!(1, subscriber.client_events.take_messages().len());
}

#[test]
fn offline_session_queues_qos1_messages() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut subscriber = Link::connect(&context, persistent_options("sub"), now);
    subscribe(&mut subscriber, "alerts", QualityOfService::AtLeastOnce, now);
    subscriber.drop_connection(now);
    assert!(!context.is_client_online("sub"));

    let mut publisher = Link::connect(&context, options("pub").build(), now);
    publisher.client.publish(PublishPacket::new("alerts", QualityOfService::AtLeastOnce, b"fire"), now).unwrap();
    publisher.client.publish(PublishPacket::new("alerts", QualityOfService::AtMostOnce, b"smoke"), now).unwrap();
    publisher.pump(now);
    assert_eq!(1, context.queued_message_count("sub"));

    subscriber.client_events.take();
    subscriber.reconnect(now);

    let events = subscriber.client_events.take();
    assert_eq!(Some(&Event::Connect("sub".to_string(), true)), events.first());
    let payloads : Vec<Vec<u8>> = events.into_iter().filter_map(|event| {
        match event {
            Event::Message(message) => { Some(message.payload) }
            _ => { None }
        }
    }).collect();
    assert_eq!(vec!(b"fire".to_vec()), payloads);
    assert_eq!(0, context.queued_message_count("sub"));
}

#[test]
fn retained_messages_set_and_clear() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut publisher = Link::connect(&context, options("pub").build(), now);
    let mut retained = PublishPacket::new("config/mode", QualityOfService::AtLeastOnce, b"eco");
    retained.retain = true;
    publisher.client.publish(retained, now).unwrap();
    publisher.pump(now);
    assert_eq!(1, context.retained_message_count());

    let mut late = Link::connect(&context, options("late").build(), now);
    let replaying = SubscribePacket {
        subscriptions: vec!(Subscription::new("config/#", QualityOfService::AtLeastOnce)),
        ..Default::default()
    };
    late.client.subscribe(replaying, now).unwrap();
    late.pump(now);
    let messages = late.client_events.take_messages();
    assert_matches!(messages.as_slice(), [message] if message.retain && message.payload == b"eco");

    let mut clear = PublishPacket::new("config/mode", QualityOfService::AtMostOnce, b"");
    clear.retain = true;
    publisher.client.publish(clear, now).unwrap();
    publisher.pump(now);
    assert_eq!(0, context.retained_message_count());

    let mut later = Link::connect(&context, options("later").build(), now);
    subscribe(&mut later, "config/#", QualityOfService::AtLeastOnce, now);
    later.pump(now);
    assert!(later.client_events.take_messages().is_empty());
}

#[test]
fn will_published_on_unclean_disconnect_only() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut watcher = Link::connect(&context, options("watcher").build(), now);
    subscribe(&mut watcher, "status/#", QualityOfService::AtLeastOnce, now);

    let will = WillMessage {
        topic: "status/device".to_string(),
        payload: b"offline".to_vec(),
        qos: QualityOfService::AtLeastOnce,
        ..Default::default()
    };

    let mut polite = Link::connect(&context, options("polite").with_will(will.clone()).build(), now);
    polite.client.disconnect(DisconnectPacket::new(DisconnectReasonCode::NormalDisconnection), now).unwrap();
    polite.pump(now);
    assert_eq!(SessionState::Disconnected, polite.broker.state());

    watcher.pump(now);
    assert!(watcher.client_events.take_messages().is_empty());

    let mut flaky = Link::connect(&context, options("flaky").with_will(will).build(), now);
    flaky.drop_connection(now);

    watcher.pump(now);
    let messages = watcher.client_events.take_messages();
    assert_matches!(messages.as_slice(), [message] if message.topic == "status/device" && message.payload == b"offline");
}

#[test]
fn session_takeover_disconnects_previous_connection() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut first = Link::connect(&context, persistent_options("device"), now);
    first.client_events.take();

    let mut second = Link::connect(&context, persistent_options("device"), now);
    assert_eq!(SessionState::Active, second.broker.state());
    assert_eq!(vec!(Event::Connect("device".to_string(), false)), second.client_events.take());

    first.pump(now);
    assert_eq!(SessionState::Disconnected, first.broker.state());
    assert_eq!(vec!(Event::Disconnect(DisconnectReasonCode::SessionTakenOver, false)), first.client_events.take());

    assert!(context.is_client_online("device"));
    assert_eq!(1, context.session_count());
}

struct FixedAcl {
    decision: AuthDecision,
}

impl AuthPlugin for FixedAcl {
    fn check_acl(&self, _: &ClientInfo, _: &str, _: AclAccess) -> AuthDecision {
        self.decision
    }
}

fn context_with_acl_chain(decisions: &[AuthDecision]) -> Arc<BrokerContext> {
    let mut builder = BrokerContext::builder(BrokerConfig::default());
    for decision in decisions {
        builder.with_auth_plugin(Arc::new(FixedAcl { decision: *decision }));
    }

    builder.build()
}

#[test]
fn acl_chain_decides_at_first_definitive_answer() {
    let now = Instant::now();

    let context = context_with_acl_chain(&[AuthDecision::Defer, AuthDecision::Defer, AuthDecision::Deny]);
    let mut link = Link::connect(&context, options("c").build(), now);
    let suback = subscribe(&mut link, "a/b", QualityOfService::AtLeastOnce, now);
    assert_eq!(vec!(SubackReasonCode::NotAuthorized), suback.reason_codes);

    let packet_id = link.client.publish(PublishPacket::new("a/b", QualityOfService::AtLeastOnce, b"x"), now).unwrap();
    link.pump(now);
    assert_eq!(vec!((packet_id, PublishCompletion::Puback(PubackReasonCode::NotAuthorized))), completions(link.client_events.take()));
    assert_eq!(0, context.subscription_count());

    let context = context_with_acl_chain(&[AuthDecision::Defer, AuthDecision::Allow, AuthDecision::Deny]);
    let mut link = Link::connect(&context, options("c").build(), now);
    let suback = subscribe(&mut link, "a/b", QualityOfService::AtLeastOnce, now);
    assert_eq!(vec!(SubackReasonCode::GrantedQos1), suback.reason_codes);
}

struct TokenAuth {}

impl AuthPlugin for TokenAuth {
    fn authenticate_start(&self, _: &str, method: &str, _: Option<&[u8]>) -> ExtendedAuthResult {
        if method == "TOKEN" { ExtendedAuthResult::Continue(b"nonce".to_vec()) } else { ExtendedAuthResult::Defer }
    }

    fn authenticate_continue(&self, _: &str, _: &str, data: Option<&[u8]>) -> ExtendedAuthResult {
        if data == Some(b"signed-nonce") { ExtendedAuthResult::Success(None) } else { ExtendedAuthResult::Deny }
    }
}

#[test]
fn extended_authentication_challenge() {
    let now = Instant::now();
    let context = BrokerContext::builder(BrokerConfig::default()).with_auth_plugin(Arc::new(TokenAuth {})).build();

    let accepted = options("secure").with_authentication_method("TOKEN").build();
    let link = Link::connect_with_handler(&context, accepted, RecordingHandler::with_auth_response(b"signed-nonce"), now);
    assert_eq!(SessionState::Active, link.client.state());
    assert_eq!(vec!(Event::Connect("secure".to_string(), false)), link.client_events.take());

    let rejected = options("imposter").with_authentication_method("TOKEN").build();
    let link = Link::connect_with_handler(&context, rejected, RecordingHandler::with_auth_response(b"forged"), now);
    assert_eq!(SessionState::Disconnected, link.client.state());
    assert!(!context.is_client_online("imposter"));
}

#[test]
fn mqtt311_client_against_broker() {
    let now = Instant::now();
    let context = BrokerContext::new(BrokerConfig::default());

    let mut subscriber = Link::connect(&context, options("legacy").with_protocol_version(ProtocolVersion::Mqtt311).build(), now);
    assert_eq!(ProtocolVersion::Mqtt311, subscriber.broker.protocol_version());
    subscribe(&mut subscriber, "legacy/#", QualityOfService::ExactlyOnce, now);

    let mut publisher = Link::connect(&context, options("modern").build(), now);
    let mut publish = PublishPacket::new("legacy/feed", QualityOfService::ExactlyOnce, b"data");
    publish.properties.add(PropertyIdentifier::ContentType, PropertyValue::String("text/plain".to_string())).unwrap();
    publisher.client.publish(publish, now).unwrap();
    publisher.pump(now);

    subscriber.pump(now);
    let messages = subscriber.client_events.take_messages();
    assert_matches!(messages.as_slice(), [message] if message.properties.is_empty() && message.payload == b"data");
}
