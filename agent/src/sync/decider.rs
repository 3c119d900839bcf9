//! Conflict decisions.
//!
//! When both sides changed a point total the coordinator asks a
//! [`ConflictDecider`] what to do. Interactive front ends answer through a
//! [`ChannelDecider`]; unattended runs use a [`FixedDecider`].

use std::future::Future;
use tally_engine::{ConflictPrompt, Resolution};
use tokio::sync::{mpsc, oneshot};

/// Decides how a conflict is resolved.
pub trait ConflictDecider: Send + Sync + 'static {
    fn decide(&self, prompt: ConflictPrompt) -> impl Future<Output = Resolution> + Send;
}

/// Always answers with the same resolution.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecider(pub Resolution);

impl ConflictDecider for FixedDecider {
    async fn decide(&self, _prompt: ConflictPrompt) -> Resolution {
        self.0
    }
}

/// A pending decision sent to the front end.
#[derive(Debug)]
pub struct ConflictRequest {
    pub prompt: ConflictPrompt,
    reply: oneshot::Sender<Resolution>,
}

impl ConflictRequest {
    /// Answer the prompt.
    pub fn respond(self, resolution: Resolution) {
        // The attempt may have been dropped already
        let _ = self.reply.send(resolution);
    }
}

/// Forwards prompts over a channel and waits for the answer.
///
/// A dropped receiver or request counts as [`Resolution::Cancel`].
#[derive(Debug, Clone)]
pub struct ChannelDecider {
    requests: mpsc::Sender<ConflictRequest>,
}

impl ChannelDecider {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ConflictRequest>) {
        let (requests, receiver) = mpsc::channel(buffer);
        (Self { requests }, receiver)
    }
}

impl ConflictDecider for ChannelDecider {
    async fn decide(&self, prompt: ConflictPrompt) -> Resolution {
        let (reply, answer) = oneshot::channel();
        if self
            .requests
            .send(ConflictRequest { prompt, reply })
            .await
            .is_err()
        {
            return Resolution::Cancel;
        }
        answer.await.unwrap_or(Resolution::Cancel)
    }
}
