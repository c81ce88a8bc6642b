/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::DimqError;
use crate::mqtt::*;
use crate::session::{PublishCompletion, SessionEventHandler};

use std::sync::{Arc, Mutex};

/// A session event as captured by [`RecordingHandler`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    Connect(String, bool),
    Message(PublishPacket),
    PublishComplete(u16, PublishCompletion),
    Subscribe(SubackPacket),
    Unsubscribe(UnsubackPacket),

    /// Reason code and whether an error caused the disconnect
    Disconnect(DisconnectReasonCode, bool),
}

/// Shared view of the events a [`RecordingHandler`] has captured
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {

    /// Removes and returns everything captured so far
    pub(crate) fn take(&self) -> Vec<Event> {
        self.events.lock().map(|mut events| std::mem::take(&mut *events)).unwrap_or_default()
    }

    /// Removes everything captured so far, keeping only delivered messages
    pub(crate) fn take_messages(&self) -> Vec<PublishPacket> {
        self.take().into_iter().filter_map(|event| {
            match event {
                Event::Message(publish) => { Some(publish) }
                _ => { None }
            }
        }).collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Event handler that records every callback into an [`EventLog`]
pub(crate) struct RecordingHandler {
    events: EventLog,
    auth_response: Option<Vec<u8>>,
}

impl RecordingHandler {
    pub(crate) fn new() -> RecordingHandler {
        RecordingHandler {
            events: EventLog::default(),
            auth_response: None,
        }
    }

    /// Answers every authentication challenge with `response`
    pub(crate) fn with_auth_response(response: &[u8]) -> RecordingHandler {
        RecordingHandler {
            events: EventLog::default(),
            auth_response: Some(response.to_vec()),
        }
    }

    pub(crate) fn events(&self) -> EventLog {
        self.events.clone()
    }
}

impl SessionEventHandler for RecordingHandler {
    fn on_connect(&mut self, client_id: &str, session_present: bool) {
        self.events.push(Event::Connect(client_id.to_string(), session_present));
    }

    fn on_message(&mut self, publish: &PublishPacket) {
        self.events.push(Event::Message(publish.clone()));
    }

    fn on_publish_complete(&mut self, packet_id: u16, completion: PublishCompletion) {
        self.events.push(Event::PublishComplete(packet_id, completion));
    }

    fn on_subscribe(&mut self, suback: &SubackPacket) {
        self.events.push(Event::Subscribe(suback.clone()));
    }

    fn on_unsubscribe(&mut self, unsuback: &UnsubackPacket) {
        self.events.push(Event::Unsubscribe(unsuback.clone()));
    }

    fn on_disconnect(&mut self, reason_code: DisconnectReasonCode, error: Option<&DimqError>) {
        self.events.push(Event::Disconnect(reason_code, error.is_some()));
    }

    fn on_auth_challenge(&mut self, _: &str, _: Option<&[u8]>) -> Option<Vec<u8>> {
        self.auth_response.clone()
    }
}
