//! Socket plumbing shared by the remote client and server.
//!
//! Both sides run poll loops over a `TcpStream` with a bounded read
//! timeout, so a stop request is observed within one poll interval and
//! partial envelopes accumulate in a [`Decoder`] across reads.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use thiserror::Error;

use crate::envelope::Envelope;
use crate::framing::{encode, Decoder, FramingError};

#[derive(Debug, Error)]
pub enum WireError {
    /// Zero-byte read: the peer closed the connection. Normal termination
    /// of that connection's processing loop, not a crash.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Malformed traffic; the connection must be torn down.
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True for errors that mean "the connection ended", as opposed to a
    /// protocol violation or an unexpected socket failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::ConnectionClosed => true,
            WireError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Read whatever bytes are currently available (waiting at most the
/// stream's read timeout) and decode any completed envelopes. Returns an
/// empty vec when the poll interval elapses with no data.
pub fn read_available(
    stream: &mut TcpStream,
    decoder: &mut Decoder,
) -> Result<Vec<Envelope>, WireError> {
    let mut chunk = [0u8; 64 * 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Err(WireError::ConnectionClosed),
            Ok(n) => {
                decoder.feed(&chunk[..n]);
                if n < chunk.len() {
                    break;
                }
            }
            Err(e) if is_poll_timeout(&e) => break,
            Err(e) => return Err(e.into()),
        }
    }

    let mut envelopes = Vec::new();
    while let Some(envelope) = decoder.next()? {
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

/// Blocking write of one envelope: header, text, then planes.
pub fn send_envelope(stream: &mut TcpStream, envelope: &Envelope) -> Result<(), WireError> {
    let bytes = encode(envelope)?;
    stream.write_all(&bytes)?;
    Ok(())
}
