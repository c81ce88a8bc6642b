/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::broker::BrokerContext;
use crate::config::*;
use crate::error::DimqResult;
use crate::session::broker::BrokerSession;
use crate::session::client::ClientSession;
use crate::testing::events::*;
use crate::testing::mock_transport::MockTransport;

use log::*;

use std::sync::Arc;
use std::time::Instant;

const MAXIMUM_PUMP_ROUNDS : usize = 32;

/// A client session wired to a broker session through in-memory transports
pub(crate) struct Link {
    pub(crate) client: ClientSession,
    pub(crate) client_events: EventLog,
    pub(crate) broker: BrokerSession,
    pub(crate) broker_events: EventLog,
    context: Arc<BrokerContext>,
    client_transport: MockTransport,
    broker_transport: MockTransport,
}

impl Link {

    /// Creates both ends and runs the CONNECT/CONNACK exchange
    pub(crate) fn connect(context: &Arc<BrokerContext>, options: ConnectOptions, now: Instant) -> Link {
        Link::connect_with_handler(context, options, RecordingHandler::new(), now)
    }

    pub(crate) fn connect_with_handler(context: &Arc<BrokerContext>, options: ConnectOptions, handler: RecordingHandler, now: Instant) -> Link {
        let client_events = handler.events();
        let config = ClientSessionConfig::builder(options).with_base_timestamp(now).build();
        let client = ClientSession::new(config, Box::new(handler));

        let broker_handler = RecordingHandler::new();
        let broker_events = broker_handler.events();
        let broker = BrokerSession::new(context.clone(), Box::new(broker_handler), now);

        let mut link = Link {
            client,
            client_events,
            broker,
            broker_events,
            context: context.clone(),
            client_transport: MockTransport::new(),
            broker_transport: MockTransport::new(),
        };

        link.client.connect(now).unwrap();
        link.pump(now);
        link
    }

    /// Moves everything the client has queued to the broker.  Returns the number of bytes moved.
    pub(crate) fn client_to_broker(&mut self, now: Instant) -> DimqResult<usize> {
        self.client.service(now)?;
        self.client.flush(&mut self.client_transport, now)?;

        let bytes = self.client_transport.take_written();
        if !bytes.is_empty() {
            self.broker.handle_incoming_bytes(&bytes, now)?;
        }

        Ok(bytes.len())
    }

    /// Moves everything the broker has queued to the client.  Returns the number of bytes moved.
    pub(crate) fn broker_to_client(&mut self, now: Instant) -> DimqResult<usize> {
        let service_result = self.broker.service(now);
        self.broker.flush(&mut self.broker_transport, now)?;

        let bytes = self.broker_transport.take_written();
        if !bytes.is_empty() {
            self.client.handle_incoming_bytes(&bytes, now)?;
        }

        service_result?;
        Ok(bytes.len())
    }

    /// Shuttles bytes in both directions until neither side has anything left to send.  Errors
    /// end the affected connection; tests observe them through the recorded events.
    pub(crate) fn pump(&mut self, now: Instant) {
        for _ in 0..MAXIMUM_PUMP_ROUNDS {
            let upstream = self.client_to_broker(now).unwrap_or_else(|error| {
                debug!("Link pump - client to broker failed: {}", error);
                0
            });

            let downstream = self.broker_to_client(now).unwrap_or_else(|error| {
                debug!("Link pump - broker to client failed: {}", error);
                0
            });

            if upstream == 0 && downstream == 0 {
                return;
            }
        }

        panic!("Link pump - traffic did not settle");
    }

    /// Breaks the network connection under both ends without either sending anything more
    pub(crate) fn drop_connection(&mut self, now: Instant) {
        self.client.connection_lost(now);
        self.broker.connection_lost(now);
        self.client_transport = MockTransport::new();
        self.broker_transport = MockTransport::new();
    }

    /// Replaces the broker end with a fresh connection and has the client connect again
    pub(crate) fn reconnect(&mut self, now: Instant) {
        let broker_handler = RecordingHandler::new();
        self.broker_events = broker_handler.events();
        self.broker = BrokerSession::new(self.context.clone(), Box::new(broker_handler), now);

        self.client.connect(now).unwrap();
        self.pump(now);
    }
}
