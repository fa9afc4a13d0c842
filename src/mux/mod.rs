//! Single-port protocol multiplexing.
//!
//! A [`MuxListener`] accepts on one TCP socket, sniffs the opening bytes of
//! every connection and hands it to the [`VirtualListener`] of the first
//! [`Matcher`] that recognises it.

mod error;
mod listener;
pub mod matcher;
mod sniff;
mod virtual_listener;

pub use error::{ClassificationFailure, MuxError, SniffError};
pub use listener::MuxListener;
pub use matcher::{
    Any, HTTP2_PREFACE, HTTP2_SERVER_SETTINGS, Http1, Http2, Http2HeaderField, Match, Matcher,
    Prefix, ValueMatch,
};
pub use sniff::{DEFAULT_SNIFF_LIMIT, SniffedStream};
pub use virtual_listener::{Connection, ConnectionInfo, VirtualListener};
