//! Bounded admission for the server's outbound queue.
//!
//! The queue is the one structure genuinely shared between a
//! capture-adjacent producer and the connection thread, so it is a real
//! concurrent channel. Control commands always enter; images are admitted
//! only while the queue is below capacity and the *incoming* frame is
//! dropped otherwise (drop-newest). The capture thread therefore never
//! blocks on the network, whatever the client's read speed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use camlink_core::{Frame, FrameMetadata, VideoFormat};

/// Commands consumed by the server's connection thread.
#[derive(Debug)]
pub enum ServerCommand {
    /// Relay one frame to a playing client.
    Image(Frame, FrameMetadata),
    /// Recording started locally with the negotiated format.
    StartedRecording(VideoFormat),
    /// Recording stopped locally.
    StoppedRecording,
    /// Shut the listener down. A local sentinel: this variant has no wire
    /// representation and can never be serialized.
    Eof,
}

/// Producer half of the outbound queue, with bounded image admission and
/// a shared skip counter.
#[derive(Clone)]
pub struct ImageGate {
    tx: flume::Sender<ServerCommand>,
    /// Capacity for queued commands before images are dropped; 0 disables
    /// the bound.
    max_buffered: usize,
    skipped: Arc<AtomicU64>,
}

impl ImageGate {
    pub fn new(tx: flume::Sender<ServerCommand>, max_buffered: usize) -> Self {
        Self {
            tx,
            max_buffered,
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Admit one frame for transmission. Returns false when the queue was
    /// full and the frame was dropped (counted as skipped).
    pub fn admit(&self, frame: Frame, meta: FrameMetadata) -> bool {
        if self.max_buffered == 0 || self.tx.len() < self.max_buffered {
            if self.tx.send(ServerCommand::Image(frame, meta)).is_ok() {
                return true;
            }
        }
        self.skipped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Count a frame that was dequeued but not transmitted (no client
    /// playing).
    pub fn note_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Total frames dropped at admission or dequeued untransmitted.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_core::testing::test_frame;

    fn frame(seq: u64) -> (Frame, FrameMetadata) {
        let format = VideoFormat::new("gray", 8, 8, 30.0);
        (test_frame(&format, seq), FrameMetadata::with_count(0.0, seq))
    }

    #[test]
    fn drops_newest_when_full() {
        let (tx, rx) = flume::unbounded();
        let gate = ImageGate::new(tx, 2);

        // Five frames against a stalled consumer: exactly two retained,
        // three skipped, and the retained two are the oldest.
        let mut admitted = Vec::new();
        for seq in 0..5 {
            let (f, m) = frame(seq);
            admitted.push(gate.admit(f, m));
        }
        assert_eq!(admitted, vec![true, true, false, false, false]);
        assert_eq!(gate.skipped(), 3);

        let queued: Vec<u64> = rx
            .try_iter()
            .map(|cmd| match cmd {
                ServerCommand::Image(_, meta) => meta.count.unwrap(),
                other => panic!("unexpected command {other:?}"),
            })
            .collect();
        assert_eq!(queued, vec![0, 1]);
    }

    #[test]
    fn admission_resumes_once_drained() {
        let (tx, rx) = flume::unbounded();
        let gate = ImageGate::new(tx, 1);

        let (f, m) = frame(0);
        assert!(gate.admit(f, m));
        let (f, m) = frame(1);
        assert!(!gate.admit(f, m));

        rx.try_iter().count();
        let (f, m) = frame(2);
        assert!(gate.admit(f, m));
        assert_eq!(gate.skipped(), 1);
    }

    #[test]
    fn zero_capacity_disables_the_bound() {
        let (tx, rx) = flume::unbounded();
        let gate = ImageGate::new(tx, 0);
        for seq in 0..100 {
            let (f, m) = frame(seq);
            assert!(gate.admit(f, m));
        }
        assert_eq!(gate.skipped(), 0);
        assert_eq!(rx.len(), 100);
    }

    #[test]
    fn skips_count_after_receiver_is_gone() {
        let (tx, rx) = flume::unbounded();
        let gate = ImageGate::new(tx, 0);
        drop(rx);
        let (f, m) = frame(0);
        assert!(!gate.admit(f, m));
        assert_eq!(gate.skipped(), 1);
    }
}
