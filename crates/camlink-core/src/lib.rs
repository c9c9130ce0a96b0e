//! Play/record lifecycles and cross-thread plumbing for camera capture.
//!
//! Every frame source is a [`Player`] and every frame sink is a
//! [`Recorder`]; both walk the same `idle -> starting -> active ->
//! stopping -> idle` state machine, with one worker thread per active
//! lifecycle and all externally driven transitions owned by the
//! controlling thread. Device backends plug in behind [`DeviceSource`],
//! encoders behind [`RecordSink`], and failures are routed through an
//! injected [`ErrorSink`].
//!
//! The remote streaming protocol built on these lifecycles lives in the
//! `camlink-remote` crate.

pub mod errors;
pub mod frame;
pub mod mailbox;
pub mod player;
pub mod recorder;
pub mod testing;
pub mod types;

pub use errors::*;
pub use frame::*;
pub use mailbox::*;
pub use player::*;
pub use recorder::*;
pub use types::*;
