//! Event stream from the engine to its caller.
//!
//! The GUI (or any other frontend) consumes these from a channel instead of
//! wiring into the engine directly. Emission never blocks a worker: the
//! channel is unbounded and a dropped receiver simply discards events.

use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    FileCopied {
        source: String,
        dest: String,
        bytes: u64,
    },
    FileSkipped {
        source: String,
        reason: String,
    },
    FileError {
        source: String,
        message: String,
    },
    ProgressUpdated {
        percent: u8,
        status: String,
    },
    /// The mount coordinator needs an elevated password; the caller answers
    /// through the credential channel.
    SudoPasswordRequested,
    /// A share-level failure forced cancellation of the whole operation.
    SmbErrorCancel,
    /// Terminal event; emitted exactly once per run, success or not.
    OperationCompleted,
}

#[derive(Clone)]
pub struct EventSink {
    tx: Sender<EngineEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<EngineEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        // A closed receiver means the caller stopped listening; keep going.
        let _ = self.tx.send(event);
    }
}
