//! Approval gateway: chat messages to approve/reject decisions
//!
//! Outbound, it opens an approval request (through the `RequestApproval`
//! transition) and sends the notification once. Delivery runs on a spawned
//! task; when it reports back, `sent_at` is recorded so a restart never sends
//! it again. Inbound, it interprets replies with a configurable lexicon.
//! Anything that is not a clear yes or no is ignored. The acknowledgement of
//! a resolved request is the caller's to send.

use std::collections::HashSet;
use std::sync::Arc;
use tapeloop_common::InboundMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::notifications;
use crate::collaborators::Messenger;
use crate::config::MessagingConfig;
use crate::db::TrackStore;
use crate::error::{OrchestratorError, Result};
use crate::models::{ApprovalRequest, Track, TrackEvent, TrackId};
use crate::orchestrator::OrchestratorEvent;

/// Outcome of a matched reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

/// Affirmative and negative vocabulary. Matching is on the whole message,
/// trimmed and lowercased.
#[derive(Debug, Clone)]
pub struct Lexicon {
    affirmative: HashSet<String>,
    negative: HashSet<String>,
}

impl Lexicon {
    pub fn new(affirmative: &[String], negative: &[String]) -> Self {
        let normalize = |words: &[String]| -> HashSet<String> {
            words.iter().map(|w| w.trim().to_lowercase()).filter(|w| !w.is_empty()).collect()
        };
        Self {
            affirmative: normalize(affirmative),
            negative: normalize(negative),
        }
    }

    pub fn parse(&self, text: &str) -> Option<Decision> {
        let normalized = text.trim().to_lowercase();
        if self.affirmative.contains(&normalized) {
            Some(Decision::Approve)
        } else if self.negative.contains(&normalized) {
            Some(Decision::Reject)
        } else {
            None
        }
    }
}

/// A reply that resolved an approval request
#[derive(Debug, Clone)]
pub struct Resolved {
    pub track: Track,
    pub decision: Decision,
}

pub struct ApprovalGateway {
    store: TrackStore,
    messenger: Arc<dyn Messenger>,
    lexicon: Lexicon,
    authorized_senders: HashSet<String>,
    /// Delivery results come back to the dispatcher as `ApprovalSent`
    events: mpsc::Sender<OrchestratorEvent>,
    /// Requests whose notification is being delivered right now
    in_flight: HashSet<(TrackId, i64)>,
}

impl ApprovalGateway {
    pub fn new(
        store: TrackStore,
        messenger: Arc<dyn Messenger>,
        config: &MessagingConfig,
        events: mpsc::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            store,
            messenger,
            lexicon: Lexicon::new(&config.affirmative, &config.negative),
            authorized_senders: config.authorized_senders.iter().cloned().collect(),
            events,
            in_flight: HashSet::new(),
        }
    }

    /// Empty allow-list accepts everyone
    pub fn is_authorized(&self, sender: &str) -> bool {
        self.authorized_senders.is_empty() || self.authorized_senders.contains(sender)
    }

    /// Open an approval request for a discovered track and, when online,
    /// start sending its notification. A failed send leaves the request
    /// unsent for the next online tick.
    pub async fn request_approval(&mut self, track_id: &str, online: bool) -> Result<Track> {
        self.open_and_send(track_id, TrackEvent::RequestApproval, online).await
    }

    /// Administrative requeue of a failed track: a fresh request is opened
    pub async fn requeue(&mut self, track_id: &str, online: bool) -> Result<Track> {
        self.open_and_send(track_id, TrackEvent::Requeue, online).await
    }

    async fn open_and_send(&mut self, track_id: &str, event: TrackEvent, online: bool) -> Result<Track> {
        let track = self.store.transition(track_id, event).await?;

        if online {
            if let Some(request) = self.store.pending_request_for(track_id).await? {
                self.send(&track, &request);
            }
        }
        Ok(track)
    }

    /// Deliver on a spawned task; the outcome arrives as `ApprovalSent`
    fn send(&mut self, track: &Track, request: &ApprovalRequest) -> bool {
        if !self.in_flight.insert((track.id.clone(), request.seq)) {
            return false;
        }

        let messenger = self.messenger.clone();
        let events = self.events.clone();
        let message = notifications::approval_request(track);
        let track_id = track.id.clone();
        let seq = request.seq;
        tokio::spawn(async move {
            let result = messenger.notify(&message).await;
            let event = OrchestratorEvent::ApprovalSent {
                track_id: track_id.clone(),
                seq,
                result,
            };
            if events.send(event).await.is_err() {
                debug!(track_id = %track_id, "Dispatcher gone; approval delivery result dropped");
            }
        });
        true
    }

    /// Record a delivery result. Failed deliveries stay unsent and are
    /// picked up by the next online tick.
    pub async fn on_sent(&mut self, track_id: &str, seq: i64, result: Result<Option<String>>) -> Result<()> {
        self.in_flight.remove(&(track_id.to_string(), seq));

        match result {
            Ok(reference) => {
                self.store
                    .mark_request_sent(track_id, seq, reference.as_deref())
                    .await?;
                info!(track_id = %track_id, seq, "Approval request sent");
            }
            Err(e) => {
                warn!(track_id = %track_id, seq, "Approval notification not sent, will retry: {}", e);
            }
        }
        Ok(())
    }

    /// Start delivering every outstanding request that was never sent.
    ///
    /// Requests already in flight are skipped; returns how many were started.
    pub async fn send_unsent(&mut self) -> Result<usize> {
        let mut started = 0;
        for request in self.store.unsent_requests().await? {
            let track = self.store.require(&request.track_id).await?;
            if self.send(&track, &request) {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Number of notifications still being delivered
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Interpret an inbound reply.
    ///
    /// Returns `None` for noise: unauthorised senders, text outside the
    /// lexicon, replies with nothing outstanding, and late replies for a
    /// track that is no longer awaiting approval.
    pub async fn on_inbound(&self, message: &InboundMessage) -> Result<Option<Resolved>> {
        if !self.is_authorized(&message.sender) {
            info!(sender = %message.sender, "Ignoring message from unauthorised sender");
            return Ok(None);
        }

        let Some(decision) = self.lexicon.parse(&message.text) else {
            debug!(sender = %message.sender, "Message is not an approval decision; ignored");
            return Ok(None);
        };

        let Some(request) = self.select_request(message).await? else {
            info!(sender = %message.sender, ?decision, "No outstanding approval request; reply ignored");
            return Ok(None);
        };

        let event = match decision {
            Decision::Approve => TrackEvent::Approve,
            Decision::Reject => TrackEvent::Reject,
        };
        let note = format!("{}: {}", message.sender, message.text.trim());

        let track = match self
            .store
            .transition_with_note(&request.track_id, event, Some(&note))
            .await
        {
            Ok(track) => track,
            Err(OrchestratorError::InvalidTransition(e)) => {
                warn!(track_id = %request.track_id, "Late approval reply ignored: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!(track_id = %track.id, ?decision, sender = %message.sender, "Approval request resolved");
        Ok(Some(Resolved { track, decision }))
    }

    /// A threaded reply resolves the request it answers; anything else
    /// resolves the oldest outstanding request.
    async fn select_request(&self, message: &InboundMessage) -> Result<Option<ApprovalRequest>> {
        if let Some(reference) = &message.in_reply_to {
            if let Some(request) = self.store.request_by_ref(reference).await? {
                if request.is_pending() {
                    return Ok(Some(request));
                }
                debug!(track_id = %request.track_id, "Reply to an already resolved request");
                return Ok(None);
            }
        }

        Ok(self.store.pending_requests().await?.into_iter().next())
    }
}
