//! Buyer-turn routing.
//!
//! The chat transport delivers `(job_id, sender, content)` events. Routing
//! is cheap and synchronous with the table lock held briefly; the actual
//! sandbox call happens in a per-job worker task fed by an mpsc channel,
//! which is what enforces one in-flight request per job and in-order
//! replies. Turns for different jobs run concurrently.

use std::sync::Arc;

use rand::RngCore;
use tokio::sync::mpsc;

use crate::chat::ChatEvent;
use crate::dispatcher::jobs::{BuyerTurn, JobState};
use crate::dispatcher::{Command, Inner, RetireReason};

/// Replies longer than this are truncated with a marker.
pub(crate) const MAX_REPLY_CHARS: usize = 3_900;
const TRUNCATION_MARKER: &str = "… [reply truncated]";

pub(crate) const MSG_QUEUED: &str =
    "All agent slots are busy right now; your job is queued and will start shortly.";
pub(crate) const MSG_STARTING: &str = "Your agent is starting up, please wait a moment.";
pub(crate) const MSG_APOLOGY: &str =
    "Sorry, something went wrong while answering. Please try again.";

/// Handle one transport event.
pub(crate) async fn handle_event(inner: &Arc<Inner>, event: ChatEvent) {
    match event {
        ChatEvent::Joined { job_id } => {
            tracing::debug!(job_id, "Joined job room");
        }
        ChatEvent::Message {
            job_id,
            sender,
            content,
        } => {
            handle_message(inner, job_id, sender, content).await;
        }
    }
}

async fn handle_message(inner: &Arc<Inner>, job_id: String, sender: String, content: String) {
    // Our own outbound messages echo back through the room.
    if inner.pool.is_self(&sender) {
        return;
    }

    let routed = {
        let mut table = inner.table.lock().await;
        if let Some(entry) = table.get_mut(&job_id) {
            // Any inbound buyer turn clears the ghost timer.
            entry.last_buyer_turn = Some(std::time::Instant::now());
            let state = entry.state;
            let tx = entry.turn_tx.clone();
            match state {
                JobState::Queued => {
                    if table.queue_position(&job_id).is_some() {
                        Some(Routed::Notice(MSG_QUEUED))
                    } else {
                        // Idle entry from reconciliation: the first buyer
                        // turn starts a fresh sandbox on demand.
                        Some(Routed::Promote)
                    }
                }
                JobState::Starting | JobState::Retiring => Some(Routed::Notice(MSG_STARTING)),
                JobState::Ready => Some(Routed::Turn(tx)),
            }
        } else {
            None
        }
    };

    match routed {
        None => {
            // Unknown job: a room we are in without any table entry.
            // On-demand recovery hits the network, so it runs detached.
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                inner.on_demand_start(&job_id).await;
            });
        }
        Some(Routed::Promote) => {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                inner.promote_idle(&job_id).await;
            });
        }
        Some(Routed::Notice(notice)) => {
            if let Err(e) = inner.chat.send(&job_id, notice).await {
                tracing::warn!(job_id, error = %e, "Failed to send notice");
            }
        }
        Some(Routed::Turn(tx)) => {
            let Some(tx) = tx else {
                tracing::warn!(job_id, "Ready job has no turn worker");
                return;
            };
            let turn = BuyerTurn { sender, content };
            if tx.send(turn).await.is_err() {
                tracing::warn!(job_id, "Turn worker gone, dropping buyer turn");
            }
        }
    }
}

enum Routed {
    Notice(&'static str),
    Turn(Option<mpsc::Sender<BuyerTurn>>),
    Promote,
}

/// Spawn the per-job worker that serialises sandbox requests.
///
/// Dropping the returned sender (clearing `turn_tx` in the table) ends the
/// worker after the current turn.
pub(crate) fn spawn_turn_worker(
    inner: Arc<Inner>,
    job_id: String,
    port: u16,
) -> mpsc::Sender<BuyerTurn> {
    let (tx, mut rx) = mpsc::channel::<BuyerTurn>(32);
    tokio::spawn(async move {
        while let Some(turn) = rx.recv().await {
            process_turn(&inner, &job_id, port, turn).await;
        }
        tracing::debug!(job_id, "Turn worker finished");
    });
    tx
}

async fn process_turn(inner: &Arc<Inner>, job_id: &str, port: u16, turn: BuyerTurn) {
    let nonce = generate_nonce();
    let log = inner.store.log(job_id);

    if let Err(e) = log.user_turn(&turn.sender, &nonce, &turn.content) {
        tracing::warn!(job_id, error = %e, "Failed to log user turn");
    }

    match inner.manager.send_request(port, &turn.content).await {
        Ok(reply) => {
            let reply = truncate_reply(&reply);
            if let Err(e) = log.assistant_turn(&nonce, port, inner.manager.model(), &reply) {
                tracing::warn!(job_id, error = %e, "Failed to log assistant turn");
            }
            if let Err(e) = inner.chat.send(job_id, &reply).await {
                tracing::warn!(job_id, error = %e, "Failed to send reply");
            }
            if let Some(entry) = inner.table.lock().await.get_mut(job_id) {
                entry.consecutive_failures = 0;
            }
        }
        Err(e) => {
            tracing::warn!(job_id, port, error = %e, "Sandbox request failed");
            if let Err(log_err) = log.append(
                &crate::joblog::LogEntry::new(crate::joblog::LogRole::System, e.to_string())
                    .with("event", "error")
                    .with("nonce", nonce.as_str()),
            ) {
                tracing::warn!(job_id, error = %log_err, "Failed to log sandbox error");
            }
            let _ = inner.chat.send(job_id, MSG_APOLOGY).await;

            // A pattern of consecutive failures retires the container; a
            // single failure keeps it.
            let failures = {
                let mut table = inner.table.lock().await;
                match table.get_mut(job_id) {
                    Some(entry) => {
                        entry.consecutive_failures += 1;
                        entry.consecutive_failures
                    }
                    None => return,
                }
            };
            if failures >= Inner::MAX_CONSECUTIVE_FAILURES {
                let _ = inner
                    .cmd_tx
                    .send(Command::Retire {
                        job_id: job_id.to_string(),
                        reason: RetireReason::SandboxFailures,
                    })
                    .await;
            }
        }
    }
}

/// Queue-position notice sent at admission time.
pub(crate) fn queued_notice(position: usize) -> String {
    format!("All agent slots are busy; you are #{position} in the queue.")
}

/// 8 random bytes, hex-encoded. Correlates the user turn, the assistant
/// turn, and any error entry for one exchange.
pub(crate) fn generate_nonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Cap a reply at [`MAX_REPLY_CHARS`] characters, appending a marker.
pub(crate) fn truncate_reply(reply: &str) -> String {
    if reply.chars().count() <= MAX_REPLY_CHARS {
        return reply.to_string();
    }
    let mut truncated: String = reply.chars().take(MAX_REPLY_CHARS).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_8_bytes_hex() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 16);
        assert!(hex::decode(&nonce).is_ok());
    }

    #[test]
    fn short_replies_pass_through() {
        assert_eq!(truncate_reply("hello"), "hello");
        let exactly: String = "x".repeat(MAX_REPLY_CHARS);
        assert_eq!(truncate_reply(&exactly), exactly);
    }

    #[test]
    fn long_replies_truncated_with_marker() {
        let long: String = "y".repeat(MAX_REPLY_CHARS + 500);
        let truncated = truncate_reply(&long);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            truncated.chars().count(),
            MAX_REPLY_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Multi-byte characters must not be split.
        let long: String = "é".repeat(MAX_REPLY_CHARS + 10);
        let truncated = truncate_reply(&long);
        assert!(truncated.starts_with('é'));
        assert!(truncated.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn queued_notice_mentions_position() {
        assert!(queued_notice(1).contains("#1"));
        assert!(queued_notice(2).contains("#2"));
    }
}
