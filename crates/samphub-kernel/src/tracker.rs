//! Call tracker — correlates calls with replies and enforces deadlines.
//!
//! Every call gets a [`MessageId`] that is never reused during the hub's
//! lifetime. A pending call ends in exactly one terminal [`CallState`]; the
//! outcome of finished calls is remembered in a bounded history so that a
//! reply arriving after a timeout (or after the recipient left) is recognised
//! and dropped instead of being reported as an unknown id.

use samphub_types::error::{HubError, HubResult};
use samphub_types::ids::{ClientId, MessageId};
use samphub_types::message::Response;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a synchronous caller eventually receives.
pub type CallOutcome = HubResult<Response>;

/// Lifecycle of a pending call. Every state except `Open` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Open,
    Resolved,
    TimedOut,
    RecipientGone,
    Cancelled,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Resolved => write!(f, "resolved"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::RecipientGone => write!(f, "recipient_gone"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How the outcome of a call reaches its issuer.
enum Completion {
    /// A blocked `call_and_wait`.
    Waiter(oneshot::Sender<CallOutcome>),
    /// An asynchronous call; the outcome is pushed as a tagged response.
    Tagged(String),
}

struct PendingCall {
    caller: ClientId,
    recipient: ClientId,
    completion: Completion,
    issued_at: Instant,
    deadline: Option<Instant>,
}

/// A finished asynchronous call whose outcome must be pushed to its caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncCompletion {
    pub caller: ClientId,
    pub responder: ClientId,
    pub tag: String,
    pub msg_id: MessageId,
    pub response: Response,
}

/// Result of [`CallTracker::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A synchronous caller was woken up.
    Woke,
    /// The hub must push this response to the asynchronous caller.
    Respond(AsyncCompletion),
    /// The call had already ended in the given state; the reply was dropped.
    Discarded(CallState),
}

struct TrackerInner {
    open: HashMap<MessageId, PendingCall>,
    retired: HashMap<MessageId, CallState>,
    retired_order: VecDeque<MessageId>,
}

/// Tracks every open call of one hub.
pub struct CallTracker {
    inner: Mutex<TrackerInner>,
    next_id: AtomicU64,
    retired_capacity: usize,
}

impl CallTracker {
    /// Create a tracker remembering up to `retired_capacity` finished calls.
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                open: HashMap::new(),
                retired: HashMap::new(),
                retired_order: VecDeque::with_capacity(retired_capacity.min(4096)),
            }),
            next_id: AtomicU64::new(1),
            retired_capacity,
        }
    }

    fn next_msg_id(&self) -> MessageId {
        MessageId::from_sequence(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(
        &self,
        caller: &ClientId,
        recipient: &ClientId,
        completion: Completion,
        timeout: Option<Duration>,
    ) -> MessageId {
        let msg_id = self.next_msg_id();
        let now = Instant::now();
        let call = PendingCall {
            caller: caller.clone(),
            recipient: recipient.clone(),
            completion,
            issued_at: now,
            deadline: timeout.and_then(|t| now.checked_add(t)),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.open.insert(msg_id.clone(), call);
        debug!(msg_id = %msg_id, caller = %caller, recipient = %recipient, "Call opened");
        msg_id
    }

    /// Open an asynchronous call whose outcome is reported under `tag`.
    pub fn start_call(
        &self,
        caller: &ClientId,
        recipient: &ClientId,
        tag: &str,
        timeout: Option<Duration>,
    ) -> MessageId {
        self.insert(caller, recipient, Completion::Tagged(tag.to_string()), timeout)
    }

    /// Open a synchronous call; the receiver yields its outcome.
    pub fn start_sync_call(
        &self,
        caller: &ClientId,
        recipient: &ClientId,
        timeout: Option<Duration>,
    ) -> (MessageId, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let msg_id = self.insert(caller, recipient, Completion::Waiter(tx), timeout);
        (msg_id, rx)
    }

    /// Resolve an open call with the recipient's reply.
    ///
    /// Only the call's recipient may resolve it ([`HubError::Auth`]); ids the
    /// hub never issued are a [`HubError::Protocol`] error.
    pub fn resolve(
        &self,
        responder: &ClientId,
        msg_id: &MessageId,
        response: Response,
    ) -> HubResult<Resolution> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let Some(call) = inner.open.get(msg_id) else {
            return match inner.retired.get(msg_id) {
                Some(state) => {
                    warn!(
                        msg_id = %msg_id,
                        responder = %responder,
                        state = %state,
                        "Discarding late reply"
                    );
                    Ok(Resolution::Discarded(*state))
                }
                None => Err(HubError::Protocol(format!("unknown message id {msg_id}"))),
            };
        };
        if &call.recipient != responder {
            return Err(HubError::Auth(format!(
                "{responder} is not the recipient of {msg_id}"
            )));
        }

        let call = match inner.open.remove(msg_id) {
            Some(call) => call,
            None => return Err(HubError::Protocol(format!("unknown message id {msg_id}"))),
        };
        Self::retire(&mut inner, self.retired_capacity, msg_id.clone(), CallState::Resolved);
        drop(inner);

        debug!(
            msg_id = %msg_id,
            elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
            "Call resolved"
        );
        match call.completion {
            Completion::Waiter(tx) => match tx.send(Ok(response)) {
                Ok(()) => Ok(Resolution::Woke),
                Err(_) => {
                    warn!(msg_id = %msg_id, "Synchronous caller stopped waiting, reply dropped");
                    Ok(Resolution::Discarded(CallState::Cancelled))
                }
            },
            Completion::Tagged(tag) => Ok(Resolution::Respond(AsyncCompletion {
                caller: call.caller,
                responder: responder.clone(),
                tag,
                msg_id: msg_id.clone(),
                response,
            })),
        }
    }

    /// Time out one call (the caller's own wait elapsed).
    ///
    /// Returns false if the call was no longer open.
    pub fn expire(&self, msg_id: &MessageId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.open.remove(msg_id).is_none() {
            return false;
        }
        Self::retire(&mut inner, self.retired_capacity, msg_id.clone(), CallState::TimedOut);
        debug!(msg_id = %msg_id, "Call timed out");
        true
    }

    /// Forget a call that never reached its recipient, retiring it as `state`.
    pub fn abandon(&self, msg_id: &MessageId, state: CallState) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.open.remove(msg_id).is_some() {
            Self::retire(&mut inner, self.retired_capacity, msg_id.clone(), state);
        }
    }

    /// End every open call targeting `recipient`.
    ///
    /// Synchronous callers are woken with [`HubError::RecipientGone`];
    /// asynchronous outcomes are returned for the hub to push.
    pub fn cancel_for_recipient_gone(&self, recipient: &ClientId) -> Vec<AsyncCompletion> {
        let calls = self.take_where(CallState::RecipientGone, |c| &c.recipient == recipient);
        let mut completions = Vec::new();
        for (msg_id, call) in calls {
            let reason = format!("recipient {recipient} unregistered before replying");
            match call.completion {
                Completion::Waiter(tx) => {
                    let _ = tx.send(Err(HubError::RecipientGone(reason)));
                }
                Completion::Tagged(tag) => completions.push(AsyncCompletion {
                    caller: call.caller,
                    responder: recipient.clone(),
                    tag,
                    msg_id,
                    response: Response::error(reason),
                }),
            }
        }
        completions
    }

    /// End every open call issued by `caller`.
    ///
    /// Blocked synchronous callers are woken with [`HubError::Cancelled`].
    pub fn cancel_for_caller_gone(&self, caller: &ClientId) -> usize {
        let calls = self.take_where(CallState::Cancelled, |c| &c.caller == caller);
        let count = calls.len();
        for (_, call) in calls {
            if let Completion::Waiter(tx) = call.completion {
                let _ = tx.send(Err(HubError::Cancelled(format!(
                    "caller {caller} unregistered"
                ))));
            }
        }
        count
    }

    /// Time out every call whose deadline is at or before `now`.
    pub fn sweep_timeouts(&self, now: Instant) -> Vec<AsyncCompletion> {
        let calls = self.take_where(CallState::TimedOut, |c| {
            c.deadline.is_some_and(|deadline| deadline <= now)
        });
        let mut completions = Vec::new();
        for (msg_id, call) in calls {
            let waited = now.saturating_duration_since(call.issued_at);
            match call.completion {
                Completion::Waiter(tx) => {
                    let _ = tx.send(Err(HubError::Timeout(waited)));
                }
                Completion::Tagged(tag) => completions.push(AsyncCompletion {
                    caller: call.caller,
                    responder: call.recipient,
                    tag,
                    msg_id,
                    response: Response::error(format!(
                        "no reply within {:.1}s",
                        waited.as_secs_f64()
                    )),
                }),
            }
        }
        completions
    }

    /// Current state of a call, if it is open or still remembered.
    pub fn state(&self, msg_id: &MessageId) -> Option<CallState> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.open.contains_key(msg_id) {
            return Some(CallState::Open);
        }
        inner.retired.get(msg_id).copied()
    }

    pub fn open_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.open.len()
    }

    fn take_where(
        &self,
        state: CallState,
        predicate: impl Fn(&PendingCall) -> bool,
    ) -> Vec<(MessageId, PendingCall)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<MessageId> = inner
            .open
            .iter()
            .filter(|(_, call)| predicate(call))
            .map(|(id, _)| id.clone())
            .collect();
        let mut taken = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(call) = inner.open.remove(&id) {
                Self::retire(&mut inner, self.retired_capacity, id.clone(), state);
                taken.push((id, call));
            }
        }
        // Issue order, so completions reach callers deterministically.
        taken.sort_by_key(|(_, call)| call.issued_at);
        taken
    }

    fn retire(inner: &mut TrackerInner, capacity: usize, msg_id: MessageId, state: CallState) {
        if capacity == 0 {
            return;
        }
        while inner.retired_order.len() >= capacity {
            if let Some(oldest) = inner.retired_order.pop_front() {
                inner.retired.remove(&oldest);
            }
        }
        inner.retired.insert(msg_id.clone(), state);
        inner.retired_order.push_back(msg_id);
    }
}
