/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module defining the byte-stream seam sessions use to reach the network.

Sessions never block.  A transport that cannot make progress reports `WouldBlock` and the session
tries again the next time it is serviced.  Socket, TLS and websocket setup all happen outside this
crate; anything implementing `std::io::Read + std::io::Write` can be wrapped in a
[`StreamTransport`].
 */

use crate::error::DimqError;

use std::error::Error;
use std::fmt;
use std::io::{ErrorKind, Read, Write};

/// Failure modes of a transport read or write
#[derive(Debug)]
pub enum TransportError {

    /// No progress is possible right now; try again later
    WouldBlock,

    /// The peer closed the stream
    Closed,

    /// Any other I/O failure
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::WouldBlock => { write!(f, "transport operation would block") }
            TransportError::Closed => { write!(f, "transport closed by peer") }
            TransportError::Io(error) => { write!(f, "transport io failure: {}", error) }
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Io(error) => { Some(error) }
            _ => { None }
        }
    }
}

impl From<TransportError> for DimqError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Closed => { DimqError::new_connection_closed("transport closed by peer") }
            TransportError::Io(io_error) => { DimqError::new_std_io_error(io_error) }
            TransportError::WouldBlock => { DimqError::new_transport_error("transport operation would block") }
        }
    }
}

/// Non-blocking byte stream a session reads packets from and writes packets to
pub trait Transport {

    /// Reads bytes into `buffer`, returning how many were read.  A closed stream is reported as
    /// `TransportError::Closed`, never as a zero-length read.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes some prefix of `bytes`, returning its length
    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;
}

/// Adapts a `std::io` stream (for example a non-blocking `TcpStream`) to the [`Transport`] trait
pub struct StreamTransport<S> where S : Read + Write {
    stream: S
}

impl<S> StreamTransport<S> where S : Read + Write {

    /// Wraps a stream
    pub fn new(stream: S) -> Self {
        StreamTransport {
            stream
        }
    }

    /// Returns a reference to the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consumes the adapter, returning the wrapped stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn map_io_error(error: std::io::Error) -> TransportError {
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => { TransportError::WouldBlock }
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => { TransportError::Closed }
        _ => { TransportError::Io(error) }
    }
}

impl<S> Transport for StreamTransport<S> where S : Read + Write {

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.read(buffer) {
            Ok(0) => { Err(TransportError::Closed) }
            Ok(bytes_read) => { Ok(bytes_read) }
            Err(error) => { Err(map_io_error(error)) }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if bytes.is_empty() {
            return Ok(0);
        }

        match self.stream.write(bytes) {
            Ok(0) => { Err(TransportError::Closed) }
            Ok(bytes_written) => { Ok(bytes_written) }
            Err(error) => { Err(map_io_error(error)) }
        }
    }
}
