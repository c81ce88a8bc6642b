/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
dimq is an MQTT 3.1, 3.1.1 and 5 protocol and session engine for both ends of a connection.

The crate is sans-io.  It owns no sockets, threads or clocks: callers feed bytes and the current
time into a session and flush the packets it produces to whatever transport they manage.

* [`mqtt`] holds the packet data model, with encoding in `encode` and incremental decoding in
  `decode`.
* [`session::client::ClientSession`] is the client-side state machine: CONNECT negotiation,
  keep alive, QoS 1/2 flows and resumption.
* [`session::broker::BrokerSession`] is the broker side of one connection.  Every broker session
  shares a [`broker::BrokerContext`] holding the session table, subscription tree, retained
  messages, security plugins and persistence hook.
* [`topic`] validates topic names and filters and implements the subscription and retain tries.
 */

pub mod alias;
pub mod broker;
pub mod codec;
pub mod config;
mod decode;
pub mod encode;
pub mod error;
pub mod inflight;
mod logging;
pub mod message;
pub mod mqtt;
pub mod session;
pub mod topic;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{DimqError, DimqResult, ErrorCategory};

pub use mqtt::*;

pub use broker::BrokerContext;
pub use broker::security::{AclAccess, AuthDecision, AuthPlugin, ClientInfo, ExtendedAuthResult};
pub use broker::persistence::PersistenceHook;
pub use codec::{Codec, FlushStatus, MqttCodec};
pub use config::*;
pub use session::{PublishCompletion, SessionEventHandler, SessionState};
pub use session::broker::BrokerSession;
pub use session::client::{ClientSession, NegotiatedSettings};
pub use transport::{StreamTransport, Transport, TransportError};

use std::time::Instant;

fn fold_timepoint(base: &Option<Instant>, new: &Instant) -> Option<Instant> {
    if let Some(base_timepoint) = &base {
        if base_timepoint < new {
            return *base;
        }
    }

    Some(*new)
}

fn fold_optional_timepoint_min(base: &Option<Instant>, new: &Option<Instant>) -> Option<Instant> {
    match (base, new) {
        (Some(base_timepoint), Some(new_timepoint)) => { Some(*base_timepoint.min(new_timepoint)) }
        (Some(_), None) => { *base }
        (None, _) => { *new }
    }
}
