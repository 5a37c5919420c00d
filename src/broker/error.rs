use std::{fmt, io, net::SocketAddr};

use quinn::{ReadExactError, WriteError};
use quinn_proto::{ConnectError, ConnectionError};

#[derive(Debug)]
pub enum Error {
    ConnectError(ConnectError),
    ConnectionError(ConnectionError),
    Io(io::Error),
    WriteError(WriteError),
    ReadExactError(ReadExactError),
    Tls(rustls::Error),
    Certificate(rcgen::RcgenError),
    /// A PEM file held no usable certificate or key.
    MissingPemItem(&'static str),
    CouldNotEncodeFrame,
    CouldNotDecodeFrame,
    FrameLengthOverflowed,
    /// No node of the cluster listens on this address.
    UnknownNode(SocketAddr),
    /// The node exists but is down.
    NodeUnavailable(SocketAddr),
    /// An administrative command named a queue or exchange that doesn't exist.
    NotFound(String),
    /// The link is gone; the command was not sent.
    Closed,
}

impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::ConnectError(error)
    }
}

impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::ConnectionError(error)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::WriteError(e)
    }
}

impl From<ReadExactError> for Error {
    fn from(e: ReadExactError) -> Self {
        Self::ReadExactError(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Self::Certificate(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectError(e) => write!(f, "could not start connecting: {e}"),
            Error::ConnectionError(e) => write!(f, "connection failed: {e}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::WriteError(e) => write!(f, "stream write failed: {e}"),
            Error::ReadExactError(e) => write!(f, "stream read failed: {e}"),
            Error::Tls(e) => write!(f, "tls error: {e}"),
            Error::Certificate(e) => write!(f, "certificate generation failed: {e}"),
            Error::MissingPemItem(what) => write!(f, "no {what} found in PEM input"),
            Error::CouldNotEncodeFrame => write!(f, "could not encode frame"),
            Error::CouldNotDecodeFrame => write!(f, "could not decode frame"),
            Error::FrameLengthOverflowed => write!(f, "frame length overflowed"),
            Error::UnknownNode(addr) => write!(f, "no broker node at {addr}"),
            Error::NodeUnavailable(addr) => write!(f, "broker node {addr} is down"),
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {}
