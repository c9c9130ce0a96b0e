//! Remote streaming for CamLink lifecycles.
//!
//! A capture source on one machine is shared across the network by
//! pairing a [`RemoteServer`] (a recorder whose sink is a TCP client)
//! with a [`RemoteClient`] (a player whose frames arrive over the same
//! connection). Envelopes are length-prefixed with a JSON text section
//! and an optional binary section carrying raw image planes; the bounded
//! outbound queue drops frames rather than ever blocking the capture
//! thread.

pub mod backpressure;
pub mod client;
pub mod envelope;
pub mod framing;
pub mod server;
pub mod wire;

pub use backpressure::*;
pub use client::*;
pub use envelope::*;
pub use framing::*;
pub use server::*;
pub use wire::*;
