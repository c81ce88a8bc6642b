/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the per-session inflight queues that track QoS 1 and 2 message flows.

Each session owns two queues.  The outgoing queue holds every QoS 1/2 message sent (or waiting to
be sent) to the peer and enforces the peer's receive maximum as a send quota.  The incoming queue
holds QoS 2 messages received from the peer that have not yet been released by a PUBREL and
enforces this side's receive maximum.

Nothing here retransmits on a timer.  Unacknowledged messages are resent only when a session
resumes on a new connection.
 */

use crate::error::{DimqError, DimqResult};
use crate::message::MessageStore;
use crate::mqtt::*;

use log::*;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which way the messages in a queue travel
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InflightDirection {

    /// Received from the peer
    Incoming,

    /// Sent to the peer
    Outgoing,
}

/// Position of a single message within its QoS flow
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QosState {

    /// Queued but not yet admitted by the send quota
    Invalid,

    /// QoS 1 PUBLISH sent, waiting for PUBACK
    WaitPuback,

    /// QoS 2 PUBLISH sent, waiting for PUBREC
    WaitPubrec,

    /// PUBREL sent, waiting for PUBCOMP
    WaitPubcomp,

    /// PUBREL resent after a reconnect, waiting for PUBCOMP
    ResendPubrel,

    /// QoS 2 PUBLISH received and acknowledged with PUBREC, waiting for PUBREL
    WaitPubrel,
}

impl fmt::Display for QosState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Flow-control quota.  `remaining` never exceeds `maximum`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Quota {
    pub maximum: u16,
    pub remaining: u16,
}

impl Quota {
    fn new(maximum: u16) -> Quota {
        Quota {
            maximum,
            remaining: maximum,
        }
    }

    fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }

        self.remaining -= 1;
        true
    }

    fn release(&mut self) {
        if self.remaining < self.maximum {
            self.remaining += 1;
        }
    }
}

/// A message bound for a particular session, with the per-subscription delivery parameters
#[derive(Clone, Debug)]
pub struct Delivery {
    pub message: Arc<MessageStore>,

    /// Quality of service to deliver at
    pub qos: QualityOfService,

    /// Retain flag to set on the outgoing PUBLISH
    pub retain: bool,

    /// Identifiers of the subscriptions that matched
    pub subscription_identifiers: Vec<u32>,
}

impl Delivery {

    /// Delivers a message at its own quality of service and retain flag
    pub fn new(message: Arc<MessageStore>) -> Delivery {
        Delivery {
            qos: message.qos(),
            retain: message.retain(),
            message,
            subscription_identifiers: Vec::new(),
        }
    }
}

/// One tracked message flow
#[derive(Clone, Debug)]
pub struct InflightRecord {
    pub message: Arc<MessageStore>,
    pub mid: u16,
    pub direction: InflightDirection,
    pub qos: QualityOfService,
    pub retain: bool,
    pub subscription_identifiers: Vec<u32>,
    pub state: QosState,

    /// Whether the next PUBLISH for this record carries the duplicate flag.  Set when a sent
    /// record goes stale or survives into a new connection.
    pub dup: bool,
    pub timestamp: Instant,
}

/// The acknowledgement kinds that move an outgoing flow forward
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AckType {
    Puback,
    Pubrec(PubrecReasonCode),
    Pubcomp,
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckType::Puback => { write!(f, "PUBACK") }
            AckType::Pubrec(reason_code) => { write!(f, "PUBREC({})", reason_code) }
            AckType::Pubcomp => { write!(f, "PUBCOMP") }
        }
    }
}

/// Result of applying an acknowledgement to the outgoing queue
#[derive(Debug)]
pub enum AckOutcome {

    /// The flow finished; the record has been removed
    Completed(InflightRecord),

    /// The flow moved to its next step
    Progressed,
}

/// Result of receiving an inbound QoS 2 PUBLISH
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IncomingOutcome {

    /// First time this packet id was seen; the message is held until PUBREL
    New,

    /// Retransmission of a message already held; re-acknowledged, not redelivered
    Duplicate,
}

/// Result of queueing a message for delivery to the peer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {

    /// QoS 0 PUBLISH written to the outbound queue
    Sent,

    /// QoS 1/2 flow admitted by the quota and sent with this packet id
    InFlight(u16),

    /// Waiting for quota.  Carries the packet id only when ids are reserved at enqueue time.
    Queued(Option<u16>),

    /// Message expiry elapsed before the message could be sent; nothing was queued
    Expired,
}

impl EnqueueOutcome {

    /// Packet id identifying the flow, if one has been assigned
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            EnqueueOutcome::InFlight(mid) => { Some(*mid) }
            EnqueueOutcome::Queued(mid) => { *mid }
            _ => { None }
        }
    }
}

/// Ordered set of inflight message flows for one direction of one session
#[derive(Debug)]
pub struct InflightQueue {
    direction: InflightDirection,

    records: VecDeque<InflightRecord>,

    quota: Quota,

    next_mid: u16,

    mids_in_use: HashSet<u16>,

    // queued records get a packet id immediately instead of on admission
    reserve_on_enqueue: bool,
}

fn build_pubrel(mid: u16) -> ControlPacket {
    ControlPacket::Pubrel(PubrelPacket {
        packet_id: mid,
        ..Default::default()
    })
}

fn build_publish(record: &InflightRecord, now: Instant) -> DimqResult<ControlPacket> {
    let mut publish = record.message.to_publish_packet(record.qos, record.mid, record.retain, &record.subscription_identifiers, now)?;
    publish.duplicate = record.dup;

    Ok(ControlPacket::Publish(publish))
}

fn state_for_new_send(qos: QualityOfService) -> QosState {
    match qos {
        QualityOfService::ExactlyOnce => { QosState::WaitPubrec }
        _ => { QosState::WaitPuback }
    }
}

impl InflightQueue {

    /// Creates an empty queue whose quota allows `maximum` concurrent flows
    pub fn new(direction: InflightDirection, maximum: u16) -> InflightQueue {
        InflightQueue {
            direction,
            records: VecDeque::new(),
            quota: Quota::new(maximum),
            next_mid: 1,
            mids_in_use: HashSet::new(),
            reserve_on_enqueue: false,
        }
    }

    /// Makes `enqueue` assign packet ids to messages still waiting for quota.  Queued messages
    /// otherwise carry packet id 0 until admitted, so a backlog never consumes the id space.
    pub fn with_packet_ids_on_enqueue(mut self) -> InflightQueue {
        self.reserve_on_enqueue = true;
        self
    }

    pub fn direction(&self) -> InflightDirection { self.direction }

    pub fn quota(&self) -> Quota { self.quota }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    /// Number of records waiting for quota
    pub fn queued_len(&self) -> usize {
        self.records.iter().filter(|record| record.state == QosState::Invalid).count()
    }

    pub fn records(&self) -> impl Iterator<Item = &InflightRecord> {
        self.records.iter()
    }

    pub fn get(&self, mid: u16) -> Option<&InflightRecord> {
        self.records.iter().find(|record| record.mid == mid)
    }

    /// Claims an unused, non-zero packet id.  Ids are handed out in increasing order, wrapping
    /// from 65535 back to 1, skipping any id still in use.
    pub fn reserve_mid(&mut self) -> DimqResult<u16> {
        let start_mid = self.next_mid;
        let mut check_mid = start_mid;

        loop {
            if self.next_mid == u16::MAX {
                self.next_mid = 1;
            } else {
                self.next_mid += 1;
            }

            if self.mids_in_use.insert(check_mid) {
                return Ok(check_mid);
            }

            if self.next_mid == start_mid {
                error!("InflightQueue reserve_mid - all packet ids are in use");
                return Err(DimqError::new_packet_id_space_exhausted());
            }

            check_mid = self.next_mid;
        }
    }

    /// Returns a packet id to the free pool
    pub fn release_mid(&mut self, mid: u16) {
        self.mids_in_use.remove(&mid);
    }

    /// Changes the quota ceiling.  Flows already admitted keep their slots.
    pub fn set_quota_maximum(&mut self, maximum: u16) {
        let admitted = self.records.iter().filter(|record| record.state != QosState::Invalid).count();
        let admitted = admitted.min(u16::MAX as usize) as u16;

        self.quota.maximum = maximum;
        self.quota.remaining = maximum.saturating_sub(admitted);
    }

    /// Queues a message for delivery to the peer.
    ///
    /// QoS 0 messages bypass the queue and go straight to `outbound`.  QoS 1/2 messages are sent
    /// immediately if the quota admits them and otherwise wait, unsent, for an earlier flow to
    /// finish.
    pub fn enqueue(&mut self, delivery: Delivery, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<EnqueueOutcome> {
        if delivery.message.is_expired(now) {
            debug!("InflightQueue enqueue - dropping expired message on topic \"{}\"", delivery.message.topic());
            return Ok(EnqueueOutcome::Expired);
        }

        if delivery.qos == QualityOfService::AtMostOnce {
            let publish = delivery.message.to_publish_packet(QualityOfService::AtMostOnce, 0, delivery.retain, &delivery.subscription_identifiers, now)?;
            outbound.push_back(ControlPacket::Publish(publish));
            return Ok(EnqueueOutcome::Sent);
        }

        let mid =
            if self.reserve_on_enqueue {
                self.reserve_mid()?
            } else {
                0
            };

        self.records.push_back(InflightRecord {
            message: delivery.message,
            mid,
            direction: self.direction,
            qos: delivery.qos,
            retain: delivery.retain,
            subscription_identifiers: delivery.subscription_identifiers,
            state: QosState::Invalid,
            dup: false,
            timestamp: now,
        });

        let index = self.records.len() - 1;
        if !self.quota.consume() {
            debug!("InflightQueue enqueue - quota exhausted, queueing message without sending");
            return Ok(EnqueueOutcome::Queued(if mid == 0 { None } else { Some(mid) }));
        }

        match self.send_admitted(index, now, outbound) {
            Ok(mid) => { Ok(EnqueueOutcome::InFlight(mid)) }
            Err(error) => {
                self.quota.release();
                if let Some(record) = self.records.pop_back() {
                    self.release_mid(record.mid);
                }

                Err(error)
            }
        }
    }

    // Sends the record at `index`, which has just consumed quota, assigning its packet id if it
    // does not have one yet
    fn send_admitted(&mut self, index: usize, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<u16> {
        if self.records[index].mid == 0 {
            let mid = self.reserve_mid()?;
            self.records[index].mid = mid;
        }

        let record = &mut self.records[index];
        record.state = state_for_new_send(record.qos);
        record.timestamp = now;
        outbound.push_back(build_publish(record, now)?);

        Ok(record.mid)
    }

    /// Applies a PUBACK, PUBREC or PUBCOMP from the peer to the outgoing flow it names
    pub fn on_ack(&mut self, mid: u16, ack: AckType, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<AckOutcome> {
        let Some(index) = self.records.iter().position(|record| record.mid == mid && record.state != QosState::Invalid) else {
            return Err(DimqError::new_inflight_not_found(mid));
        };

        let record = &mut self.records[index];
        match (ack, record.qos, record.state) {
            (AckType::Puback, QualityOfService::AtLeastOnce, QosState::WaitPuback) => {}
            (AckType::Pubrec(reason_code), QualityOfService::ExactlyOnce, QosState::WaitPubrec) => {
                if reason_code.is_success() {
                    record.state = QosState::WaitPubcomp;
                    record.timestamp = now;
                    outbound.push_back(build_pubrel(mid));
                    return Ok(AckOutcome::Progressed);
                }

                debug!("InflightQueue on_ack - PUBREC for mid {} carried failure reason {}", mid, reason_code);
            }
            (AckType::Pubrec(_), QualityOfService::ExactlyOnce, QosState::WaitPubcomp | QosState::ResendPubrel) => {
                outbound.push_back(build_pubrel(mid));
                return Ok(AckOutcome::Progressed);
            }
            (AckType::Pubcomp, QualityOfService::ExactlyOnce, QosState::WaitPubcomp | QosState::ResendPubrel) => {}
            _ => {
                error!("InflightQueue on_ack - {} does not match mid {} in state {}", ack, mid, record.state);
                return Err(DimqError::new_protocol_mismatch(mid));
            }
        }

        let completed = self.complete_at(index, now, outbound)?;
        Ok(AckOutcome::Completed(completed))
    }

    /// Removes an outgoing flow that can never complete, such as a PUBLISH too large for the
    /// peer, and admits the next queued message in its place
    pub fn discard(&mut self, mid: u16, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<Option<InflightRecord>> {
        match self.records.iter().position(|record| mid != 0 && record.mid == mid) {
            Some(index) => { Ok(Some(self.complete_at(index, now, outbound)?)) }
            None => { Ok(None) }
        }
    }

    fn complete_at(&mut self, index: usize, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<InflightRecord> {
        let Some(record) = self.records.remove(index) else {
            return Err(DimqError::new_internal_state_error("inflight record index out of range"));
        };

        self.release_mid(record.mid);
        if record.state != QosState::Invalid {
            self.quota.release();
        }

        self.admit_queued(now, outbound)?;

        Ok(record)
    }

    // Sends queued records, oldest first, while quota remains
    fn admit_queued(&mut self, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<()> {
        let mut index = 0;
        while self.quota.remaining > 0 && index < self.records.len() {
            if self.records[index].state != QosState::Invalid {
                index += 1;
                continue;
            }

            if self.records[index].message.is_expired(now) {
                if let Some(expired) = self.records.remove(index) {
                    debug!("InflightQueue admit_queued - dropping expired message with mid {}", expired.mid);
                    self.release_mid(expired.mid);
                }
                continue;
            }

            self.quota.consume();
            if let Err(error) = self.send_admitted(index, now, outbound) {
                self.quota.release();
                return Err(error);
            }

            index += 1;
        }

        Ok(())
    }

    /// Records an inbound QoS 2 PUBLISH and answers it with PUBREC.  Exceeding this side's
    /// receive maximum is a fatal quota violation.
    pub fn receive_qos2(&mut self, mid: u16, delivery: Delivery, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<IncomingOutcome> {
        let pubrec = ControlPacket::Pubrec(PubrecPacket {
            packet_id: mid,
            ..Default::default()
        });

        if self.get(mid).is_some() {
            outbound.push_back(pubrec);
            return Ok(IncomingOutcome::Duplicate);
        }

        if !self.quota.consume() {
            error!("InflightQueue receive_qos2 - receive maximum of {} exceeded", self.quota.maximum);
            return Err(DimqError::new_quota_exceeded(DisconnectReasonCode::ReceiveMaximumExceeded, "inbound receive maximum exceeded"));
        }

        self.mids_in_use.insert(mid);
        self.records.push_back(InflightRecord {
            message: delivery.message,
            mid,
            direction: self.direction,
            qos: delivery.qos,
            retain: delivery.retain,
            subscription_identifiers: delivery.subscription_identifiers,
            state: QosState::WaitPubrel,
            dup: false,
            timestamp: now,
        });

        outbound.push_back(pubrec);
        Ok(IncomingOutcome::New)
    }

    /// Applies an inbound PUBREL, answering with PUBCOMP and returning the released message.
    /// An unknown packet id is answered with a PUBCOMP carrying PacketIdentifierNotFound.
    pub fn release_incoming(&mut self, mid: u16, outbound: &mut VecDeque<ControlPacket>) -> Option<InflightRecord> {
        let position = self.records.iter().position(|record| record.mid == mid && record.state == QosState::WaitPubrel);

        let mut pubcomp = PubcompPacket {
            packet_id: mid,
            ..Default::default()
        };

        let released = match position {
            Some(index) => {
                self.release_mid(mid);
                self.quota.release();
                self.records.remove(index)
            }
            None => {
                warn!("InflightQueue release_incoming - PUBREL for unknown mid {}", mid);
                pubcomp.reason_code = PubcompReasonCode::PacketIdentifierNotFound;
                None
            }
        };

        outbound.push_back(ControlPacket::Pubcomp(pubcomp));
        released
    }

    /// Marks sent outgoing records older than `horizon` as duplicates.  Nothing is resent; the
    /// marks only matter when the session later resumes.
    pub fn retry_check(&mut self, now: Instant, horizon: Duration) -> usize {
        let mut marked = 0;
        for record in self.records.iter_mut() {
            if record.state == QosState::Invalid || record.state == QosState::WaitPubrel {
                continue;
            }

            if now.saturating_duration_since(record.timestamp) >= horizon && !record.dup {
                record.dup = true;
                marked += 1;
            }
        }

        marked
    }

    /// Rebuilds flow state when a session resumes on a new connection.
    ///
    /// Outgoing: PUBRELs awaiting PUBCOMP are resent, then unacknowledged PUBLISHes are resent
    /// as duplicates while quota allows and revert to queued beyond that.  Incoming: only QoS 2
    /// records survive, still waiting for their PUBREL.
    pub fn reconnect_reset(&mut self, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> DimqResult<()> {
        match self.direction {
            InflightDirection::Incoming => {
                self.records.retain(|record| record.qos == QualityOfService::ExactlyOnce && record.state == QosState::WaitPubrel);
                self.mids_in_use = self.records.iter().map(|record| record.mid).collect();

                let held = self.records.len().min(u16::MAX as usize) as u16;
                self.quota.remaining = self.quota.maximum.saturating_sub(held);
            }
            InflightDirection::Outgoing => {
                self.quota.remaining = self.quota.maximum;

                let mut expired = 0;
                let mut index = 0;
                while index < self.records.len() {
                    match self.records[index].state {
                        QosState::WaitPubcomp | QosState::ResendPubrel => {
                            let record = &mut self.records[index];
                            record.state = QosState::ResendPubrel;
                            record.timestamp = now;
                            self.quota.consume();
                            outbound.push_back(build_pubrel(record.mid));
                        }
                        state => {
                            if self.records[index].message.is_expired(now) {
                                if let Some(record) = self.records.remove(index) {
                                    self.release_mid(record.mid);
                                }
                                expired += 1;
                                continue;
                            }

                            if state != QosState::Invalid {
                                self.records[index].dup = true;
                            }

                            if self.quota.consume() {
                                if let Err(error) = self.send_admitted(index, now, outbound) {
                                    self.quota.release();
                                    return Err(error);
                                }
                            } else {
                                self.records[index].state = QosState::Invalid;
                            }
                        }
                    }

                    index += 1;
                }

                if expired > 0 {
                    debug!("InflightQueue reconnect_reset - dropped {} expired messages", expired);
                }
            }
        }

        Ok(())
    }

    /// Drops every record and restores the full quota
    pub fn clear(&mut self) {
        self.records.clear();
        self.mids_in_use.clear();
        self.quota.remaining = self.quota.maximum;
    }
}

impl fmt::Display for InflightQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InflightQueue {{ direction:{:?}, records:{}, quota:{}/{}", self.direction, self.records.len(), self.quota.remaining, self.quota.maximum)?;
        if log_enabled!(Level::Trace) {
            write!(f, ", states: [")?;
            for record in self.records.iter() {
                write!(f, " ({}, {})", record.mid, record.state)?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageOrigin;

    use assert_matches::assert_matches;

    fn message(topic: &str, qos: QualityOfService) -> Arc<MessageStore> {
        MessageStore::new(topic, b"payload", qos, false, PropertyList::new(), None, MessageOrigin::default(), Instant::now()).into_shared(None)
    }

    fn delivery(topic: &str, qos: QualityOfService) -> Delivery {
        Delivery::new(message(topic, qos))
    }

    fn reserving_queue(maximum: u16) -> InflightQueue {
        InflightQueue::new(InflightDirection::Outgoing, maximum).with_packet_ids_on_enqueue()
    }

    fn enqueue_mid(queue: &mut InflightQueue, delivery: Delivery, now: Instant, outbound: &mut VecDeque<ControlPacket>) -> u16 {
        queue.enqueue(delivery, now, outbound).unwrap().packet_id().unwrap()
    }

    fn assert_quota_invariant(queue: &InflightQueue) {
        let quota = queue.quota();
        assert!(quota.remaining <= quota.maximum);

        let admitted = queue.records().filter(|record| record.state != QosState::Invalid).count();
        assert_eq!(quota.maximum as usize - quota.remaining as usize, admitted);
    }

    fn published_mids(outbound: &VecDeque<ControlPacket>) -> Vec<(u16, bool)> {
        outbound.iter().filter_map(|packet| {
            if let ControlPacket::Publish(publish) = packet {
                Some((publish.packet_id, publish.duplicate))
            } else {
                None
            }
        }).collect()
    }

    #[test]
    fn reserve_mid_sequence() {
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 10);

        assert_matches!(queue.reserve_mid(), Ok(1));
        assert_matches!(queue.reserve_mid(), Ok(2));
        queue.release_mid(1);
        assert_matches!(queue.reserve_mid(), Ok(3));
    }

    #[test]
    fn reserve_mid_wraps_and_skips_in_use() {
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 10);
        queue.next_mid = 65534;
        queue.mids_in_use.insert(65535);
        queue.mids_in_use.insert(1);

        assert_matches!(queue.reserve_mid(), Ok(65534));
        assert_matches!(queue.reserve_mid(), Ok(2));
    }

    #[test]
    fn reserve_mid_exhausted() {
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 10);
        for mid in 1..=u16::MAX {
            queue.mids_in_use.insert(mid);
        }

        assert_matches!(queue.reserve_mid(), Err(DimqError::PacketIdSpaceExhausted(_)));
    }

    #[test]
    fn qos0_bypasses_queue() {
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 1);
        let mut outbound = VecDeque::new();

        assert_eq!(EnqueueOutcome::Sent, queue.enqueue(delivery("a", QualityOfService::AtMostOnce), Instant::now(), &mut outbound).unwrap());
        assert_eq!(EnqueueOutcome::Sent, queue.enqueue(delivery("b", QualityOfService::AtMostOnce), Instant::now(), &mut outbound).unwrap());
        assert!(queue.is_empty());
        assert_eq!(vec!((0, false), (0, false)), published_mids(&outbound));
    }

    #[test]
    fn quota_admits_fifo_on_completion() {
        let now = Instant::now();
        let mut queue = reserving_queue(2);
        let mut outbound = VecDeque::new();

        let first = enqueue_mid(&mut queue, delivery("t/1", QualityOfService::AtLeastOnce), now, &mut outbound);
        let second = enqueue_mid(&mut queue, delivery("t/2", QualityOfService::ExactlyOnce), now, &mut outbound);
        let third = enqueue_mid(&mut queue, delivery("t/3", QualityOfService::AtLeastOnce), now, &mut outbound);
        let fourth = enqueue_mid(&mut queue, delivery("t/4", QualityOfService::AtLeastOnce), now, &mut outbound);
        assert_quota_invariant(&queue);

        assert_eq!(vec!((first, false), (second, false)), published_mids(&outbound));
        assert_eq!(QosState::Invalid, queue.get(third).unwrap().state);
        outbound.clear();

        assert_matches!(queue.on_ack(first, AckType::Puback, now, &mut outbound), Ok(AckOutcome::Completed(record)) if record.mid == first);
        assert_quota_invariant(&queue);
        assert_eq!(vec!((third, false)), published_mids(&outbound));
        assert_eq!(QosState::Invalid, queue.get(fourth).unwrap().state);
        outbound.clear();

        assert_matches!(queue.on_ack(second, AckType::Pubrec(PubrecReasonCode::Success), now, &mut outbound), Ok(AckOutcome::Progressed));
        assert_matches!(outbound.pop_front(), Some(ControlPacket::Pubrel(pubrel)) if pubrel.packet_id == second);
        assert_matches!(queue.on_ack(second, AckType::Pubcomp, now, &mut outbound), Ok(AckOutcome::Completed(_)));
        assert_eq!(vec!((fourth, false)), published_mids(&outbound));
        assert_quota_invariant(&queue);
    }

    #[test]
    fn ack_errors() {
        let now = Instant::now();
        let mut queue = reserving_queue(1);
        let mut outbound = VecDeque::new();

        let qos1 = enqueue_mid(&mut queue, delivery("t", QualityOfService::AtLeastOnce), now, &mut outbound);
        let queued = enqueue_mid(&mut queue, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound);

        assert_matches!(queue.on_ack(qos1, AckType::Pubcomp, now, &mut outbound), Err(DimqError::ProtocolMismatch(context)) if context.mid == qos1);
        assert_matches!(queue.on_ack(queued, AckType::Pubrec(PubrecReasonCode::Success), now, &mut outbound), Err(DimqError::InflightNotFound(_)));
        assert_matches!(queue.on_ack(999, AckType::Puback, now, &mut outbound), Err(DimqError::InflightNotFound(_)));
    }

    #[test]
    fn failed_pubrec_completes_flow() {
        let now = Instant::now();
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 5);
        let mut outbound = VecDeque::new();

        let mid = enqueue_mid(&mut queue, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound);
        outbound.clear();

        assert_matches!(queue.on_ack(mid, AckType::Pubrec(PubrecReasonCode::NotAuthorized), now, &mut outbound), Ok(AckOutcome::Completed(_)));
        assert!(outbound.is_empty());
        assert!(queue.is_empty());
        assert_eq!(5, queue.quota().remaining);
    }

    #[test]
    fn incoming_qos2_duplicate_and_release() {
        let now = Instant::now();
        let mut queue = InflightQueue::new(InflightDirection::Incoming, 1);
        let mut outbound = VecDeque::new();

        assert_matches!(queue.receive_qos2(42, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound), Ok(IncomingOutcome::New));
        assert_matches!(queue.receive_qos2(42, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound), Ok(IncomingOutcome::Duplicate));
        assert_eq!(2, outbound.iter().filter(|packet| matches!(packet, ControlPacket::Pubrec(_))).count());

        assert_matches!(queue.receive_qos2(43, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound), Err(DimqError::QuotaExceeded(context)) if context.reason_code == DisconnectReasonCode::ReceiveMaximumExceeded);

        outbound.clear();
        assert!(queue.release_incoming(42, &mut outbound).is_some());
        assert_matches!(outbound.pop_front(), Some(ControlPacket::Pubcomp(pubcomp)) if pubcomp.reason_code == PubcompReasonCode::Success);

        assert!(queue.release_incoming(42, &mut outbound).is_none());
        assert_matches!(outbound.pop_front(), Some(ControlPacket::Pubcomp(pubcomp)) if pubcomp.reason_code == PubcompReasonCode::PacketIdentifierNotFound);
    }

    #[test]
    fn reconnect_reset_outgoing() {
        let now = Instant::now();
        let mut queue = reserving_queue(3);
        let mut outbound = VecDeque::new();

        let qos2_released = enqueue_mid(&mut queue, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound);
        let qos1_sent = enqueue_mid(&mut queue, delivery("t", QualityOfService::AtLeastOnce), now, &mut outbound);
        let qos2_sent = enqueue_mid(&mut queue, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound);
        let queued = enqueue_mid(&mut queue, delivery("t", QualityOfService::AtLeastOnce), now, &mut outbound);
        queue.on_ack(qos2_released, AckType::Pubrec(PubrecReasonCode::Success), now, &mut outbound).unwrap();
        outbound.clear();

        queue.set_quota_maximum(2);
        queue.reconnect_reset(now, &mut outbound).unwrap();

        assert_matches!(outbound.pop_front(), Some(ControlPacket::Pubrel(pubrel)) if pubrel.packet_id == qos2_released);
        assert_eq!(vec!((qos1_sent, true)), published_mids(&outbound));
        assert_eq!(QosState::ResendPubrel, queue.get(qos2_released).unwrap().state);
        assert_eq!(QosState::Invalid, queue.get(qos2_sent).unwrap().state);
        assert_eq!(QosState::Invalid, queue.get(queued).unwrap().state);
        assert_quota_invariant(&queue);

        outbound.clear();
        assert_matches!(queue.on_ack(qos2_released, AckType::Pubcomp, now, &mut outbound), Ok(AckOutcome::Completed(_)));
        assert_eq!(vec!((qos2_sent, true)), published_mids(&outbound));
        assert_quota_invariant(&queue);
    }

    #[test]
    fn reconnect_reset_incoming_keeps_qos2() {
        let now = Instant::now();
        let mut queue = InflightQueue::new(InflightDirection::Incoming, 4);
        let mut outbound = VecDeque::new();

        queue.receive_qos2(7, delivery("t", QualityOfService::ExactlyOnce), now, &mut outbound).unwrap();
        queue.reconnect_reset(now, &mut outbound).unwrap();

        assert_eq!(1, queue.len());
        assert_eq!(3, queue.quota().remaining);
    }

    #[test]
    fn retry_check_only_marks() {
        let start = Instant::now();
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 4);
        let mut outbound = VecDeque::new();

        let mid = enqueue_mid(&mut queue, delivery("t", QualityOfService::AtLeastOnce), start, &mut outbound);
        outbound.clear();

        assert_eq!(0, queue.retry_check(start + Duration::from_secs(5), Duration::from_secs(20)));
        assert_eq!(1, queue.retry_check(start + Duration::from_secs(25), Duration::from_secs(20)));
        assert!(queue.get(mid).unwrap().dup);
        assert!(outbound.is_empty());
    }

    #[test]
    fn queued_messages_take_ids_on_admission() {
        let now = Instant::now();
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 2);
        let mut outbound = VecDeque::new();

        assert_eq!(EnqueueOutcome::InFlight(1), queue.enqueue(delivery("t/1", QualityOfService::AtLeastOnce), now, &mut outbound).unwrap());
        assert_eq!(EnqueueOutcome::InFlight(2), queue.enqueue(delivery("t/2", QualityOfService::ExactlyOnce), now, &mut outbound).unwrap());
        assert_eq!(EnqueueOutcome::Queued(None), queue.enqueue(delivery("t/3", QualityOfService::AtLeastOnce), now, &mut outbound).unwrap());
        assert_eq!(1, queue.queued_len());
        assert_quota_invariant(&queue);
        outbound.clear();

        assert_matches!(queue.on_ack(1, AckType::Puback, now, &mut outbound), Ok(AckOutcome::Completed(_)));
        assert_eq!(vec!((3, false)), published_mids(&outbound));
        assert_eq!(0, queue.queued_len());
        assert_eq!(QosState::WaitPuback, queue.get(3).unwrap().state);
        assert_quota_invariant(&queue);
    }

    #[test]
    fn unacknowledged_backlog_never_exhausts_packet_ids() {
        let now = Instant::now();
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 20);
        let mut outbound = VecDeque::new();

        for _ in 0..70_000 {
            assert_matches!(queue.enqueue(delivery("flood", QualityOfService::AtLeastOnce), now, &mut outbound), Ok(EnqueueOutcome::InFlight(_) | EnqueueOutcome::Queued(None)));
        }

        assert_eq!(20, published_mids(&outbound).len());
        assert_eq!(70_000 - 20, queue.queued_len());
        assert_eq!(20, queue.mids_in_use.len());
        assert_quota_invariant(&queue);
    }

    #[test]
    fn expired_message_is_reported() {
        let now = Instant::now();
        let mut queue = InflightQueue::new(InflightDirection::Outgoing, 4);
        let mut outbound = VecDeque::new();

        let expiring = MessageStore::new("t", b"stale", QualityOfService::AtLeastOnce, false, PropertyList::new(), Some(1), MessageOrigin::default(), now).into_shared(None);

        assert_eq!(EnqueueOutcome::Expired, queue.enqueue(Delivery::new(expiring), now + Duration::from_secs(2), &mut outbound).unwrap());
        assert!(queue.is_empty());
        assert!(outbound.is_empty());
    }
}
