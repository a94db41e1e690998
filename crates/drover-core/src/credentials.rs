//! Credential delivery from the caller to the mount coordinator.
//!
//! The engine never prompts for anything itself. It pushes a request over a
//! channel, the frontend resolves it (dialog, keyring, terminal prompt) and
//! replies through the bundled one-shot sender. Waits poll in short ticks so
//! a pending prompt cannot outlive cancellation.

use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::cancel::CancelFlag;
use crate::errors::{CopyError, CopyResult};

const REPLY_POLL: Duration = Duration::from_millis(500);

/// SMB account material written into the transient credentials file.
#[derive(Clone, Default)]
pub struct ShareCredentials {
    pub username: String,
    pub password: String,
    pub domain: String,
}

impl std::fmt::Debug for ShareCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never let a password reach a log line.
        f.debug_struct("ShareCredentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// A single request the frontend must answer. `None` replies mean the user
/// declined, which the coordinator maps to `CredentialsUnavailable`.
pub enum CredentialRequest {
    Share {
        server: String,
        share: String,
        reply: Sender<Option<ShareCredentials>>,
    },
    SudoPassword {
        reply: Sender<Option<String>>,
    },
}

/// Engine-side handle for asking the caller for credentials.
#[derive(Clone)]
pub struct CredentialSource {
    tx: Sender<CredentialRequest>,
}

impl CredentialSource {
    pub fn channel() -> (Self, Receiver<CredentialRequest>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn share_credentials(
        &self,
        server: &str,
        share: &str,
        cancel: &CancelFlag,
    ) -> CopyResult<ShareCredentials> {
        let (reply_tx, reply_rx) = bounded(1);
        let request = CredentialRequest::Share {
            server: server.to_string(),
            share: share.to_string(),
            reply: reply_tx,
        };
        self.ask(request, reply_rx, cancel)
    }

    pub fn sudo_password(&self, cancel: &CancelFlag) -> CopyResult<String> {
        let (reply_tx, reply_rx) = bounded(1);
        let request = CredentialRequest::SudoPassword { reply: reply_tx };
        self.ask(request, reply_rx, cancel)
    }

    fn ask<T>(
        &self,
        request: CredentialRequest,
        reply_rx: Receiver<Option<T>>,
        cancel: &CancelFlag,
    ) -> CopyResult<T> {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        if self.tx.send(request).is_err() {
            // Frontend dropped its end; nobody will ever answer.
            return Err(CopyError::CredentialsUnavailable);
        }
        loop {
            match reply_rx.recv_timeout(REPLY_POLL) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => return Err(CopyError::CredentialsUnavailable),
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        return Err(CopyError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CopyError::CredentialsUnavailable)
                }
            }
        }
    }
}
