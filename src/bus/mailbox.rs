//! Per-kind bounded mailboxes plus the coordinator reply channel.
//!
//! Every agent kind gets one bounded FIFO queue shared by all of its
//! workers. Replies flow back on a single unbounded channel so workers can
//! never block on a coordinator that is itself waiting for mailbox space.
//!
//! Dispatches are tracked in an in-flight ledger until the coordinator
//! acknowledges the reply. Entries whose reply never shows up are redelivered
//! a bounded number of times, then reported as exhausted.

use crate::agent::AgentKind;
use crate::bus::message::{DeliveryKey, Message, MessagePayload, Recipient};
use crate::core::task::TaskId;
use crate::config::BusConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What `send` does when the recipient's mailbox is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Suspend the sender until space frees up.
    #[default]
    Backpressure,
    /// Fail immediately with `MailboxFull`.
    Reject,
}

struct Mailbox {
    sender: mpsc::Sender<Message>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    fn push_now(&self, kind: &AgentKind, message: Message) -> Result<()> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::MailboxFull {
                recipient: kind.to_string(),
                capacity: self.sender.max_capacity(),
            },
            TrySendError::Closed(_) => Error::BusClosed,
        })
    }
}

struct InFlight {
    message: Message,
    window: Duration,
    expires_at: Instant,
    redeliveries: u32,
}

/// Outcome of one redelivery sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedeliveryReport {
    /// Dispatches pushed back into their mailbox.
    pub redelivered: Vec<DeliveryKey>,
    /// Dispatches that used up their redeliveries and were dropped from
    /// the ledger. The caller decides what that means for the task.
    pub exhausted: Vec<DeliveryKey>,
}

impl RedeliveryReport {
    pub fn is_empty(&self) -> bool {
        self.redelivered.is_empty() && self.exhausted.is_empty()
    }
}

pub struct MessageBus {
    config: BusConfig,
    mailboxes: HashMap<AgentKind, Mailbox>,
    replies: mpsc::UnboundedSender<Message>,
    in_flight: Mutex<HashMap<DeliveryKey, InFlight>>,
}

impl MessageBus {
    /// Create a bus with one mailbox per kind. Returns the receiving end of
    /// the coordinator reply channel.
    pub fn new(
        config: BusConfig,
        kinds: impl IntoIterator<Item = AgentKind>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (replies, reply_rx) = mpsc::unbounded_channel();
        let mailboxes = kinds
            .into_iter()
            .map(|kind| (kind, Mailbox::new(config.mailbox_capacity)))
            .collect();
        let bus = Self {
            config,
            mailboxes,
            replies,
            in_flight: Mutex::new(HashMap::new()),
        };
        (bus, reply_rx)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        let mut kinds: Vec<AgentKind> = self.mailboxes.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn mailbox(&self, kind: &AgentKind) -> Result<&Mailbox> {
        self.mailboxes
            .get(kind)
            .ok_or_else(|| Error::UnknownAgentKind(kind.clone()))
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<DeliveryKey, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========== Sending ==========

    /// Deliver `message` to its recipient.
    ///
    /// Agent mailboxes follow the configured [`DeliveryMode`]. The reply
    /// channel is unbounded and never blocks.
    pub async fn send(&self, message: Message) -> Result<()> {
        match self.config.mode {
            DeliveryMode::Backpressure => self.deliver(message, true).await,
            DeliveryMode::Reject => self.deliver(message, false).await,
        }
    }

    /// Deliver without ever suspending, regardless of mode.
    pub fn try_send(&self, message: Message) -> Result<()> {
        let kind = match &message.recipient {
            Recipient::Coordinator => return self.reply(message),
            Recipient::Agent(kind) => kind.clone(),
        };
        let mailbox = self.mailbox(&kind)?;
        let key = self.record(&message);
        let result = mailbox.push_now(&kind, message);
        self.settle(key, &result);
        result
    }

    async fn deliver(&self, message: Message, wait: bool) -> Result<()> {
        let kind = match &message.recipient {
            Recipient::Coordinator => return self.reply(message),
            Recipient::Agent(kind) => kind.clone(),
        };
        let mailbox = self.mailbox(&kind)?;
        let key = self.record(&message);
        let result = if wait {
            mailbox
                .sender
                .send(message)
                .await
                .map_err(|_| Error::BusClosed)
        } else {
            mailbox.push_now(&kind, message)
        };
        self.settle(key, &result);
        result
    }

    fn reply(&self, message: Message) -> Result<()> {
        self.replies.send(message).map_err(|_| Error::BusClosed)
    }

    /// Enter a dispatch into the in-flight ledger before it is pushed.
    /// Dispatches without a deadline are not tracked.
    fn record(&self, message: &Message) -> Option<DeliveryKey> {
        let MessagePayload::Dispatch { request } = &message.payload else {
            return None;
        };
        let window = request.deadline? + self.config.redelivery_grace();
        let key = message.delivery_key();
        self.ledger().insert(
            key.clone(),
            InFlight {
                message: message.clone(),
                window,
                expires_at: Instant::now() + window,
                redeliveries: 0,
            },
        );
        Some(key)
    }

    fn settle(&self, key: Option<DeliveryKey>, result: &Result<()>) {
        if let (Some(key), Err(_)) = (key, result) {
            self.ledger().remove(&key);
        }
    }

    // ========== Receiving ==========

    /// Wait for the next message in `kind`'s mailbox. Workers of the same
    /// kind take turns; each message goes to exactly one of them.
    ///
    /// Returns `None` once the mailbox is closed.
    pub async fn receive(&self, kind: &AgentKind) -> Result<Option<Message>> {
        let mailbox = self.mailbox(kind)?;
        let mut receiver = mailbox.receiver.lock().await;
        Ok(receiver.recv().await)
    }

    /// Take the next queued message without waiting for one to arrive.
    pub async fn try_receive(&self, kind: &AgentKind) -> Result<Option<Message>> {
        let mailbox = self.mailbox(kind)?;
        let mut receiver = mailbox.receiver.lock().await;
        Ok(receiver.try_recv().ok())
    }

    /// Free slots in `kind`'s mailbox.
    pub fn available_capacity(&self, kind: &AgentKind) -> usize {
        self.mailboxes
            .get(kind)
            .map(|m| m.sender.capacity())
            .unwrap_or(0)
    }

    /// Messages queued in `kind`'s mailbox.
    pub fn queue_depth(&self, kind: &AgentKind) -> usize {
        self.mailboxes
            .get(kind)
            .map(|m| m.sender.max_capacity() - m.sender.capacity())
            .unwrap_or(0)
    }

    // ========== In-flight ledger ==========

    /// Mark the dispatch behind `key` as answered. Returns whether it was
    /// still tracked.
    pub fn acknowledge(&self, key: &DeliveryKey) -> bool {
        self.ledger().remove(key).is_some()
    }

    pub fn in_flight_count(&self) -> usize {
        self.ledger().len()
    }

    /// Earliest instant at which a tracked dispatch expires.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.ledger().values().map(|e| e.expires_at).min()
    }

    /// Stop tracking every dispatch of `task_id`.
    pub fn forget_task(&self, task_id: &TaskId) {
        self.ledger().retain(|key, _| &key.task_id != task_id);
    }

    /// Redeliver every expired dispatch that still has redeliveries left.
    /// Expired dispatches past `max_redeliveries` are removed and reported.
    pub fn redeliver_expired(&self) -> RedeliveryReport {
        let now = Instant::now();
        let mut report = RedeliveryReport::default();
        let mut ledger = self.ledger();

        let mut expired: Vec<DeliveryKey> = ledger
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort();

        for key in expired {
            let Some(entry) = ledger.get_mut(&key) else {
                continue;
            };
            if entry.redeliveries >= self.config.max_redeliveries {
                warn!(delivery = %key, "no reply after {} redeliveries", entry.redeliveries);
                ledger.remove(&key);
                report.exhausted.push(key);
                continue;
            }
            let Recipient::Agent(kind) = &entry.message.recipient else {
                ledger.remove(&key);
                continue;
            };
            let pushed = self
                .mailboxes
                .get(kind)
                .map(|m| m.push_now(kind, entry.message.clone()));
            match pushed {
                Some(Ok(())) => {
                    entry.redeliveries += 1;
                    entry.expires_at = now + entry.window;
                    debug!(delivery = %key, attempt = entry.redeliveries, "redelivered");
                    report.redelivered.push(key);
                }
                Some(Err(e)) => {
                    debug!(delivery = %key, error = %e, "redelivery deferred");
                    entry.expires_at = now + self.config.redelivery_grace();
                }
                None => {
                    ledger.remove(&key);
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("kinds", &self.kinds())
            .field("mode", &self.config.mode)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
