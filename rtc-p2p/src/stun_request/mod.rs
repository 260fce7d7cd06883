//! Sans-I/O STUN transaction engine.
//!
//! [`RequestManager`] owns every outstanding STUN request of a port. It
//! serializes and transmits requests, retransmits them on the schedule of a
//! [`RetransmitPolicy`], matches responses by transaction id and reports
//! exactly one [`RequestEvent`] per request.
//!
//! The caller drives it like any other [`sansio::Protocol`]:
//!
//! 1. [`handle_write()`](sansio::Protocol::handle_write) (or [`RequestManager::send`]) a request
//! 2. transmit everything from [`poll_write()`](sansio::Protocol::poll_write)
//! 3. pass decoded STUN responses to [`handle_read()`](sansio::Protocol::handle_read)
//! 4. call [`handle_timeout()`](sansio::Protocol::handle_timeout) when
//!    [`poll_timeout()`](sansio::Protocol::poll_timeout) expires
//! 5. drain [`poll_event()`](sansio::Protocol::poll_event)

#[cfg(test)]
mod stun_request_test;

mod retransmit;

pub use retransmit::RetransmitPolicy;

use bytes::BytesMut;
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportMessage};
use stun::message::*;

/// A STUN request handed to the [`RequestManager`].
///
/// `message` must already be fully built (transaction id, integrity and
/// fingerprint). `context` is returned untouched in the final event.
#[derive(Debug, Clone)]
pub struct StunRequest<C> {
    pub message: Message,
    pub context: C,
    pub policy: RetransmitPolicy,
}

/// Why sending a datagram failed, as reported by the socket owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    NetworkUnreachable,
    Other,
}

/// Inputs other than responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestInput {
    /// Sending the datagram of `transaction_id` failed.
    SendFailed {
        transaction_id: TransactionId,
        kind: SendErrorKind,
    },
}

/// Why a request ended without a success response.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFailure {
    /// The peer answered with an error response.
    ErrorResponse { response: Message, rtt: Duration },
    /// No response after the last retransmission.
    Timeout,
    /// The network reported the destination unreachable.
    NetworkUnreachable,
    /// The request was cancelled by its owner.
    Cancelled,
}

/// Final outcome of a request. Exactly one is emitted per request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent<C> {
    Success {
        transaction_id: TransactionId,
        context: C,
        response: Message,
        rtt: Duration,
    },
    Failure {
        transaction_id: TransactionId,
        context: C,
        reason: RequestFailure,
    },
}

impl<C> RequestEvent<C> {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            RequestEvent::Success { transaction_id, .. }
            | RequestEvent::Failure { transaction_id, .. } => *transaction_id,
        }
    }

    pub fn context(&self) -> &C {
        match self {
            RequestEvent::Success { context, .. } | RequestEvent::Failure { context, .. } => {
                context
            }
        }
    }
}

struct Transaction<C> {
    raw: BytesMut,
    transport: TransportContext,
    context: C,
    policy: RetransmitPolicy,
    n_sent: u32,
    last_sent: Instant,
    deadline: Instant,
}

impl<C> Transaction<C> {
    fn retransmits(&self) -> u32 {
        self.n_sent.saturating_sub(1)
    }

    fn transmit(&mut self, now: Instant) -> TaggedBytesMut {
        self.n_sent += 1;
        self.last_sent = now;
        self.deadline = now + self.policy.interval(self.n_sent - 1);
        TransportMessage {
            now,
            transport: self.transport,
            message: self.raw.clone(),
        }
    }
}

/// Outstanding STUN transactions keyed by transaction id.
pub struct RequestManager<C> {
    transactions: HashMap<TransactionId, Transaction<C>>,
    write_outs: VecDeque<TaggedBytesMut>,
    event_outs: VecDeque<RequestEvent<C>>,
    closed: bool,
}

impl<C> Default for RequestManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> RequestManager<C> {
    pub fn new() -> Self {
        Self {
            transactions: HashMap::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
            closed: false,
        }
    }

    /// Transmits `request` now and schedules its retransmissions.
    ///
    /// # Errors
    ///
    /// [`Error::ErrTransactionExists`] if a request with the same
    /// transaction id is still live, [`Error::ErrAlreadyClosed`] after close.
    pub fn send(&mut self, request: TransportMessage<StunRequest<C>>) -> Result<TransactionId> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }

        let TransportMessage {
            now,
            transport,
            message: StunRequest {
                message,
                context,
                policy,
            },
        } = request;

        let transaction_id = message.transaction_id;
        if self.transactions.contains_key(&transaction_id) {
            return Err(Error::ErrTransactionExists);
        }

        let mut tr = Transaction {
            raw: BytesMut::from(&message.raw[..]),
            transport,
            context,
            policy,
            n_sent: 0,
            last_sent: now,
            deadline: now,
        };
        trace!(
            "sending {} {:?} to {}",
            message.typ, transaction_id, transport.peer_addr
        );
        self.write_outs.push_back(tr.transmit(now));
        self.transactions.insert(transaction_id, tr);

        Ok(transaction_id)
    }

    /// Whether `transaction_id` is still waiting for a response.
    pub fn has_request(&self, transaction_id: &TransactionId) -> bool {
        self.transactions.contains_key(transaction_id)
    }

    /// Whether any live request's context satisfies `pred`.
    pub fn has_request_where(&self, mut pred: impl FnMut(&C) -> bool) -> bool {
        self.transactions.values().any(|tr| pred(&tr.context))
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Ends `transaction_id` with [`RequestFailure::Cancelled`].
    /// Returns false if it was not live.
    pub fn cancel(&mut self, transaction_id: &TransactionId) -> bool {
        if let Some(tr) = self.transactions.remove(transaction_id) {
            self.fail(*transaction_id, tr, RequestFailure::Cancelled);
            true
        } else {
            false
        }
    }

    /// Cancels every request whose context satisfies `pred`.
    /// The failure events are queued before this returns.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&C) -> bool) -> usize {
        let ids: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|(_, tr)| pred(&tr.context))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.cancel(id);
        }
        ids.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        self.cancel_where(|_| true)
    }

    fn fail(&mut self, transaction_id: TransactionId, tr: Transaction<C>, reason: RequestFailure) {
        debug!(
            "transaction {:?} to {} failed: {:?}",
            transaction_id, tr.transport.peer_addr, reason
        );
        self.event_outs.push_back(RequestEvent::Failure {
            transaction_id,
            context: tr.context,
            reason,
        });
    }
}

impl<C> sansio::Protocol<TransportMessage<Message>, TransportMessage<StunRequest<C>>, RequestInput>
    for RequestManager<C>
{
    type Rout = ();
    type Wout = TaggedBytesMut;
    type Eout = RequestEvent<C>;
    type Error = Error;
    type Time = Instant;

    /// Matches a decoded STUN response against the live transactions.
    ///
    /// Requests, indications and responses with an unknown transaction id
    /// are dropped silently.
    fn handle_read(&mut self, msg: TransportMessage<Message>) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }

        let response = msg.message;
        let class = response.typ.class;
        if class != CLASS_SUCCESS_RESPONSE && class != CLASS_ERROR_RESPONSE {
            trace!("ignoring non-response {} from {}", response.typ, msg.transport.peer_addr);
            return Ok(());
        }

        let transaction_id = response.transaction_id;
        let Some(tr) = self.transactions.remove(&transaction_id) else {
            debug!(
                "no transaction for {} {:?} from {}",
                response.typ, transaction_id, msg.transport.peer_addr
            );
            return Ok(());
        };

        let rtt = msg.now.saturating_duration_since(tr.last_sent);
        if class == CLASS_SUCCESS_RESPONSE {
            self.event_outs.push_back(RequestEvent::Success {
                transaction_id,
                context: tr.context,
                response,
                rtt,
            });
        } else {
            self.fail(
                transaction_id,
                tr,
                RequestFailure::ErrorResponse { response, rtt },
            );
        }

        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, msg: TransportMessage<StunRequest<C>>) -> Result<()> {
        self.send(msg).map(|_| ())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.write_outs.pop_front()
    }

    /// Applies a send failure reported by the socket owner.
    ///
    /// An unreachable network fails the transaction at once. Other errors are
    /// left to the retransmission schedule.
    fn handle_event(&mut self, evt: RequestInput) -> Result<()> {
        match evt {
            RequestInput::SendFailed {
                transaction_id,
                kind: SendErrorKind::NetworkUnreachable,
            } => {
                if let Some(tr) = self.transactions.remove(&transaction_id) {
                    self.fail(transaction_id, tr, RequestFailure::NetworkUnreachable);
                }
            }
            RequestInput::SendFailed {
                transaction_id,
                kind: SendErrorKind::Other,
            } => {
                debug!("send of {transaction_id:?} failed, waiting for retransmission");
            }
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }

        let mut expired = vec![];
        for (id, tr) in self.transactions.iter_mut() {
            if tr.deadline > now {
                continue;
            }
            if tr.retransmits() >= tr.policy.max_retransmits {
                expired.push(*id);
            } else {
                trace!(
                    "retransmitting transaction {:?} to {} (n_rtx={})",
                    id,
                    tr.transport.peer_addr,
                    tr.retransmits() + 1
                );
                self.write_outs.push_back(tr.transmit(now));
            }
        }

        for id in expired {
            if let Some(tr) = self.transactions.remove(&id) {
                self.fail(id, tr, RequestFailure::Timeout);
            }
        }

        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.transactions.values().map(|tr| tr.deadline).min()
    }

    /// Drops every live transaction and queued output without emitting
    /// events.
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.transactions.clear();
        self.write_outs.clear();
        self.event_outs.clear();
        Ok(())
    }
}
