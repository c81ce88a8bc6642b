/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::transport::{Transport, TransportError};

use std::collections::VecDeque;

/// In-memory transport.  Reads drain a queue the test fills; writes land in a buffer the test
/// inspects.
#[derive(Default)]
pub(crate) struct MockTransport {
    inbound: VecDeque<u8>,
    inbound_closed: bool,
    written: Vec<u8>,

    /// Bytes writable before writes start reporting `WouldBlock`; `None` is unlimited
    write_budget: Option<usize>,
}

impl MockTransport {
    pub(crate) fn new() -> MockTransport {
        MockTransport::default()
    }

    pub(crate) fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_budget = limit;
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }

    pub(crate) fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    pub(crate) fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter());
    }

    /// Once the queued inbound bytes are consumed, reads report a closed stream
    pub(crate) fn close_inbound(&mut self) {
        self.inbound_closed = true;
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        if self.inbound.is_empty() {
            return if self.inbound_closed { Err(TransportError::Closed) } else { Err(TransportError::WouldBlock) };
        }

        let count = buffer.len().min(self.inbound.len());
        for (slot, byte) in buffer.iter_mut().zip(self.inbound.drain(..count)) {
            *slot = byte;
        }

        Ok(count)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let count = match self.write_budget {
            Some(0) => { return Err(TransportError::WouldBlock); }
            Some(budget) => { budget.min(bytes.len()) }
            None => { bytes.len() }
        };

        if let Some(budget) = self.write_budget.as_mut() {
            *budget -= count;
        }

        self.written.extend_from_slice(&bytes[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn reads_until_closed() {
        let mut transport = MockTransport::new();
        let mut buffer = [0u8; 4];
        assert_matches!(transport.read(&mut buffer), Err(TransportError::WouldBlock));

        transport.push_inbound(&[1, 2, 3, 4, 5, 6]);
        transport.close_inbound();
        assert_eq!(4, transport.read(&mut buffer).unwrap());
        assert_eq!(2, transport.read(&mut buffer).unwrap());
        assert_eq!([5, 6], buffer[..2]);
        assert_matches!(transport.read(&mut buffer), Err(TransportError::Closed));
    }

    #[test]
    fn write_budget_blocks() {
        let mut transport = MockTransport::new();
        transport.set_write_limit(Some(3));
        assert_eq!(3, transport.write(&[9; 5]).unwrap());
        assert_matches!(transport.write(&[9; 2]), Err(TransportError::WouldBlock));

        transport.set_write_limit(None);
        assert_eq!(2, transport.write(&[9; 2]).unwrap());
        assert_eq!(5, transport.take_written().len());
        assert!(transport.written().is_empty());
    }
}
