//! Core message receiver.
//!
//! Translates the event-driven link world into an async pull API. A
//! dedicated reactor task owns the link, the prefetch queue, and the pending
//! receive queue; public methods submit closures to it through the
//! dispatcher and await their promise. The disposition tracker is the one
//! structure shared beyond the reactor (with the timeout reaper).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ferrobus_amqp::condition::ErrorCondition;
use ferrobus_amqp::constants::{
    CONDITION_DETACH_FORCED, CONDITION_INTERNAL_ERROR, DEADLETTER_DESCRIPTION_HEADER,
    DEADLETTER_REASON_HEADER, DEAD_LETTER_NAME, LINK_PEEK_MODE_PROPERTY, LINK_TIMEOUT_PROPERTY,
    SESSION_FILTER, TRACKING_ID_PROPERTY, TRACKING_ID_TOKEN_SEPARATOR,
};
use ferrobus_amqp::link::{
    EndpointState, LinkEvent, LinkEventEnvelope, LinkEvents, LinkFactory, LinkSettings,
    ReceiveLink, SenderSettleMode, SettleModePair, Source,
};
use ferrobus_amqp::message::{
    decode_message, DeliveryTag, Message, MessageWithDeliveryTag, MessageWithLockToken,
};
use ferrobus_amqp::outcome::Outcome;
use ferrobus_amqp::time::adjust_server_timeout;
use ferrobus_amqp::value::{Value, ValueMap};
use uuid::Uuid;

use crate::config::ReceiverOptions;
use crate::credit::CreditController;
use crate::dispatcher::{Dispatcher, Job};
use crate::disposition::DispositionTracker;
use crate::error::{ReceiverError, Result};
use crate::management::{DispositionStatus, ManagementClient};
use crate::prefetch::{DeliveryRegistry, PrefetchQueue};
use crate::reaper::{self, REAPER_PERIOD};
use crate::retry::RetryPolicy;
use crate::session::SessionState;
use crate::work::{ReceiveQueue, ReceiveWorkItem, UpdateStateWorkItem};

/// Observed state of the receive link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkLifecycle {
    Init,
    Opening,
    Open,
    Reopening,
    Closed,
}

/// Diagnostic snapshot of the receiver, captured for error context.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Endpoint host of the underlying connection.
    pub endpoint: String,
    /// Entity path the receiver consumes from.
    pub path: String,
    /// Broker tracking id when echoed, else the link name.
    pub reference_id: Option<String>,
    /// Configured prefetch count; `None` until the link has opened.
    pub prefetch_count: Option<u32>,
    /// Credit on the link at the last update; `None` until opened.
    pub link_credit: Option<u32>,
    /// Messages sitting in the prefetch queue; `None` until opened.
    pub prefetched_message_count: Option<usize>,
}

#[derive(Default)]
struct Diagnostics {
    opened: bool,
    reference_id: Option<String>,
    link_credit: u32,
    prefetched: usize,
}

struct Shared {
    name: String,
    path: String,
    factory: Arc<dyn LinkFactory>,
    dispatcher: Dispatcher<Reactor>,
    operation_timeout: Duration,
    receive_timeout: Duration,
    settle_mode: SettleModePair,
    prefetch_count: Mutex<u32>,
    session: Mutex<SessionState>,
    tracker: DispositionTracker,
    retry: RetryPolicy,
    management: ManagementClient,
    last_link_error: Mutex<Option<ReceiverError>>,
    closing: AtomicBool,
    close_result: watch::Sender<Option<Result<()>>>,
    diagnostics: Mutex<Diagnostics>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn last_error_boxed(&self) -> Option<Box<ReceiverError>> {
        self.last_link_error.lock().clone().map(Box::new)
    }

    fn closed_error(&self) -> ReceiverError {
        ReceiverError::Closed {
            cause: self.last_error_boxed(),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

struct OpenWaiter {
    tx: oneshot::Sender<Result<()>>,
    timer: JoinHandle<()>,
}

/// Reactor-owned state. Every method here runs on the reactor task.
struct Reactor {
    shared: Arc<Shared>,
    events_tx: LinkEvents,
    link: Option<Box<dyn ReceiveLink>>,
    link_epoch: u64,
    lifecycle: LinkLifecycle,
    prefetched: PrefetchQueue,
    registry: DeliveryRegistry,
    pending_receives: ReceiveQueue,
    credit: CreditController,
    open_waiter: Option<OpenWaiter>,
    retry_attempts: u32,
    next_receive_id: u64,
    stopped: bool,
}

/// Asynchronous pull receiver over one credit-flow link.
///
/// Created with [`MessageReceiver::create`] or
/// [`MessageReceiver::create_session`]; the returned future resolves once
/// the link open handshake completes. Call [`MessageReceiver::close`] when
/// done; dropping without closing leaks the background tasks.
pub struct MessageReceiver {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver").finish_non_exhaustive()
    }
}

impl MessageReceiver {
    /// Opens a receiver on `path`.
    pub async fn create(
        factory: Arc<dyn LinkFactory>,
        name: impl Into<String>,
        path: impl Into<String>,
        options: ReceiverOptions,
    ) -> Result<MessageReceiver> {
        Self::create_internal(factory, name.into(), path.into(), SessionState::disabled(), options)
            .await
    }

    /// Opens a session receiver on `path`. `session_id: None` asks the
    /// broker for the next available session; the id echoed on the remote
    /// source is authoritative either way. A browsable session receiver
    /// never issues credit and only sees messages through management peek.
    pub async fn create_session(
        factory: Arc<dyn LinkFactory>,
        name: impl Into<String>,
        path: impl Into<String>,
        session_id: Option<String>,
        browsable: bool,
        options: ReceiverOptions,
    ) -> Result<MessageReceiver> {
        Self::create_internal(
            factory,
            name.into(),
            path.into(),
            SessionState::new(session_id, browsable),
            options,
        )
        .await
    }

    async fn create_internal(
        factory: Arc<dyn LinkFactory>,
        name: String,
        path: String,
        session: SessionState,
        options: ReceiverOptions,
    ) -> Result<MessageReceiver> {
        let (dispatcher, jobs) = Dispatcher::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (close_result, _) = watch::channel(None);
        let tracker = DispositionTracker::new();
        let browsable = session.browsable;

        let shared = Arc::new(Shared {
            management: ManagementClient::new(
                factory.clone(),
                path.clone(),
                options.operation_timeout,
            ),
            name,
            path,
            factory,
            dispatcher,
            operation_timeout: options.operation_timeout,
            receive_timeout: options.receive_timeout,
            settle_mode: options.settle_mode,
            prefetch_count: Mutex::new(options.prefetch_count),
            session: Mutex::new(session),
            tracker: tracker.clone(),
            retry: RetryPolicy::new(options.retry),
            last_link_error: Mutex::new(None),
            closing: AtomicBool::new(false),
            close_result,
            diagnostics: Mutex::new(Diagnostics::default()),
            reaper: Mutex::new(None),
        });

        let reactor = Reactor {
            shared: shared.clone(),
            events_tx,
            link: None,
            link_epoch: 0,
            lifecycle: LinkLifecycle::Init,
            prefetched: PrefetchQueue::new(),
            registry: DeliveryRegistry::new(),
            pending_receives: ReceiveQueue::new(),
            credit: CreditController::new(browsable),
            open_waiter: None,
            retry_attempts: 0,
            next_receive_id: 0,
            stopped: false,
        };
        tokio::spawn(run_reactor(reactor, jobs, events_rx));
        *shared.reaper.lock() = Some(reaper::spawn(tracker, REAPER_PERIOD));

        let receiver = MessageReceiver { shared };

        let (tx, rx) = oneshot::channel();
        let timeout_ms = options.operation_timeout.as_millis() as u64;
        let timer = receiver.shared.dispatcher.dispatch_after(
            options.operation_timeout,
            "open",
            move |reactor| reactor.fail_open_if_pending(timeout_ms),
        );
        let dispatched = receiver.shared.dispatcher.dispatch("open", move |reactor| {
            reactor.open_waiter = Some(OpenWaiter { tx, timer });
            reactor.create_receive_link();
        });
        if let Err(err) = dispatched {
            receiver.abort_background();
            return Err(err);
        }

        match rx.await {
            Ok(Ok(())) => Ok(receiver),
            Ok(Err(err)) => {
                receiver.abort_background();
                Err(err)
            }
            Err(_) => {
                receiver.abort_background();
                Err(receiver.shared.closed_error())
            }
        }
    }

    /// Receives up to `max_count` messages, waiting at most the configured
    /// receive timeout. Resolves with an empty batch when nothing arrives.
    pub async fn receive(&self, max_count: u32) -> Result<Vec<MessageWithDeliveryTag>> {
        self.receive_with_timeout(max_count, self.shared.receive_timeout)
            .await
    }

    /// Receives up to `max_count` messages, waiting at most `timeout`.
    ///
    /// Requests are served strictly FIFO; the head request gets the next
    /// batch, which may be smaller than `max_count`. A timeout resolves with
    /// an empty batch, never an error.
    pub async fn receive_with_timeout(
        &self,
        max_count: u32,
        timeout: Duration,
    ) -> Result<Vec<MessageWithDeliveryTag>> {
        self.throw_if_closed()?;
        let prefetch_count = *self.shared.prefetch_count.lock();
        if max_count == 0 || max_count > prefetch_count {
            return Err(ReceiverError::invalid_argument(format!(
                "max_count must be positive and no greater than the prefetch count ({prefetch_count})"
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.shared
            .dispatcher
            .dispatch("receive", move |reactor| {
                reactor.handle_receive(tx, max_count, timeout)
            })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Completes a received message.
    pub async fn complete(&self, delivery_tag: &DeliveryTag) -> Result<()> {
        self.update_message_state(delivery_tag, Outcome::Accepted, "complete")
            .await
    }

    /// Abandons a received message, optionally merging annotations.
    pub async fn abandon(
        &self,
        delivery_tag: &DeliveryTag,
        properties_to_modify: Option<ValueMap>,
    ) -> Result<()> {
        let outcome = Outcome::abandon(properties_to_modify.unwrap_or_default());
        self.update_message_state(delivery_tag, outcome, "abandon")
            .await
    }

    /// Defers a received message; it becomes retrievable only by sequence
    /// number.
    pub async fn defer(
        &self,
        delivery_tag: &DeliveryTag,
        properties_to_modify: Option<ValueMap>,
    ) -> Result<()> {
        let outcome = Outcome::defer(properties_to_modify.unwrap_or_default());
        self.update_message_state(delivery_tag, outcome, "defer").await
    }

    /// Dead-letters a received message with an optional reason, description,
    /// and extra properties.
    pub async fn dead_letter(
        &self,
        delivery_tag: &DeliveryTag,
        reason: Option<&str>,
        description: Option<&str>,
        properties_to_modify: Option<ValueMap>,
    ) -> Result<()> {
        let mut info = ValueMap::new();
        if let Some(reason) = reason {
            info.insert(DEADLETTER_REASON_HEADER.into(), Value::from(reason));
        }
        if let Some(description) = description {
            info.insert(DEADLETTER_DESCRIPTION_HEADER.into(), Value::from(description));
        }
        if let Some(properties) = properties_to_modify {
            info.extend(properties);
        }
        let outcome = Outcome::Rejected {
            error: Some(ErrorCondition::new(DEAD_LETTER_NAME).with_info(info)),
        };
        self.update_message_state(delivery_tag, outcome, "deadLetter")
            .await
    }

    async fn update_message_state(
        &self,
        delivery_tag: &DeliveryTag,
        outcome: Outcome,
        op: &'static str,
    ) -> Result<()> {
        self.throw_if_closed()?;
        let (tx, rx) = oneshot::channel();
        let tag = delivery_tag.clone();
        let timeout = self.shared.operation_timeout;
        self.shared.dispatcher.dispatch(op, move |reactor| {
            reactor.handle_update_state(tag, outcome, tx, timeout)
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Completes a message by its lock token through the management channel.
    pub async fn complete_by_lock_token(&self, lock_token: Uuid) -> Result<()> {
        self.update_disposition(&[lock_token], DispositionStatus::Completed, None, None, None)
            .await
    }

    /// Abandons a message by its lock token.
    pub async fn abandon_by_lock_token(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<ValueMap>,
    ) -> Result<()> {
        self.update_disposition(
            &[lock_token],
            DispositionStatus::Abandoned,
            None,
            None,
            properties_to_modify,
        )
        .await
    }

    /// Defers a message by its lock token.
    pub async fn defer_by_lock_token(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<ValueMap>,
    ) -> Result<()> {
        self.update_disposition(
            &[lock_token],
            DispositionStatus::Deferred,
            None,
            None,
            properties_to_modify,
        )
        .await
    }

    /// Dead-letters a message by its lock token.
    pub async fn dead_letter_by_lock_token(
        &self,
        lock_token: Uuid,
        reason: Option<&str>,
        description: Option<&str>,
        properties_to_modify: Option<ValueMap>,
    ) -> Result<()> {
        self.update_disposition(
            &[lock_token],
            DispositionStatus::Suspended,
            reason,
            description,
            properties_to_modify,
        )
        .await
    }

    /// Updates the disposition of locked messages by token.
    pub async fn update_disposition(
        &self,
        lock_tokens: &[Uuid],
        status: DispositionStatus,
        deadletter_reason: Option<&str>,
        deadletter_description: Option<&str>,
        properties_to_modify: Option<ValueMap>,
    ) -> Result<()> {
        self.throw_if_closed()?;
        let session_id = self.session_id();
        self.shared
            .management
            .update_disposition(
                lock_tokens,
                status,
                deadletter_reason,
                deadletter_description,
                properties_to_modify,
                session_id.as_deref(),
            )
            .await
    }

    /// Renews the locks held for `lock_tokens`, returning the new expiry for
    /// each.
    pub async fn renew_message_locks(&self, lock_tokens: &[Uuid]) -> Result<Vec<SystemTime>> {
        self.throw_if_closed()?;
        let session_id = self.session_id();
        self.shared
            .management
            .renew_message_locks(lock_tokens, session_id.as_deref())
            .await
    }

    /// Fetches previously deferred messages by sequence number.
    pub async fn receive_by_sequence_numbers(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<MessageWithLockToken>> {
        self.throw_if_closed()?;
        let session_id = self.session_id();
        self.shared
            .management
            .receive_by_sequence_numbers(
                sequence_numbers,
                self.shared.settle_mode.receiver,
                session_id.as_deref(),
            )
            .await
    }

    /// Renews the session lock and refreshes
    /// [`session_locked_until`](Self::session_locked_until).
    pub async fn renew_session_lock(&self) -> Result<SystemTime> {
        self.throw_if_closed()?;
        let session_id = self.require_session_id()?;
        let expiry = self
            .shared
            .management
            .renew_session_lock(&session_id)
            .await?;
        self.shared.session.lock().locked_until = Some(expiry);
        Ok(expiry)
    }

    /// Reads the session's opaque state blob, `None` when never set.
    pub async fn get_session_state(&self) -> Result<Option<Vec<u8>>> {
        self.throw_if_closed()?;
        let session_id = self.require_session_id()?;
        self.shared.management.get_session_state(&session_id).await
    }

    /// Writes (or clears, with `None`) the session's opaque state blob.
    pub async fn set_session_state(&self, session_state: Option<&[u8]>) -> Result<()> {
        self.throw_if_closed()?;
        let session_id = self.require_session_id()?;
        self.shared
            .management
            .set_session_state(&session_id, session_state)
            .await
    }

    /// Peeks messages starting at `from_sequence_number` without locking
    /// them. `session_id` may name any session, which is how browsable
    /// receivers read.
    pub async fn peek_messages(
        &self,
        from_sequence_number: i64,
        message_count: i32,
        session_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.throw_if_closed()?;
        self.shared
            .management
            .peek_messages(from_sequence_number, message_count, session_id)
            .await
    }

    /// Changes the prefetch count. The old-minus-new delta is fed to the
    /// flow accumulator on the reactor: a growth leaves a deficit that
    /// replenishment repays before any further flow, a shrink flushes the
    /// difference (the broker clamps credit at zero).
    pub fn set_prefetch_count(&self, value: u32) -> Result<()> {
        if value == 0 {
            return Err(ReceiverError::invalid_argument(
                "prefetch count must be positive",
            ));
        }
        let delta = {
            let mut guard = self.shared.prefetch_count.lock();
            let old = *guard;
            *guard = value;
            i64::from(old) - i64::from(value)
        };
        self.shared
            .dispatcher
            .dispatch("setPrefetchCount", move |reactor| reactor.send_flow(delta))
    }

    /// The configured prefetch count.
    pub fn prefetch_count(&self) -> u32 {
        *self.shared.prefetch_count.lock()
    }

    /// The receiver name (client id).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The entity path this receiver consumes from.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// The session id, once confirmed by the remote source. `None` for
    /// plain receivers and before the open completes.
    pub fn session_id(&self) -> Option<String> {
        let session = self.shared.session.lock();
        if session.enabled {
            session.id.clone()
        } else {
            None
        }
    }

    /// When the session lock expires, `None` while unknown. Fails on a
    /// non-session receiver.
    pub fn session_locked_until(&self) -> Result<Option<SystemTime>> {
        let session = self.shared.session.lock();
        if !session.enabled {
            return Err(ReceiverError::invalid_argument(
                "not a session receiver",
            ));
        }
        Ok(session.locked_until)
    }

    /// Diagnostic snapshot for error reporting.
    pub fn error_context(&self) -> ErrorContext {
        let diagnostics = self.shared.diagnostics.lock();
        let mut context = ErrorContext {
            endpoint: self.shared.factory.endpoint(),
            path: self.shared.path.clone(),
            reference_id: diagnostics.reference_id.clone(),
            ..ErrorContext::default()
        };
        if diagnostics.opened {
            context.prefetch_count = Some(*self.shared.prefetch_count.lock());
            context.link_credit = Some(diagnostics.link_credit);
            context.prefetched_message_count = Some(diagnostics.prefetched);
        }
        context
    }

    /// Closes the receiver: pending receives resolve (empty on a clean
    /// close), pending dispositions fail, the link and the management
    /// channel close. Idempotent; every caller observes the same result.
    pub async fn close(&self) -> Result<()> {
        let first = !self.shared.closing.swap(true, Ordering::SeqCst);
        if first {
            let timeout_ms = self.shared.operation_timeout.as_millis() as u64;
            self.shared.dispatcher.dispatch_after(
                self.shared.operation_timeout,
                "close",
                move |reactor| {
                    reactor.finish_close(Err(ReceiverError::Timeout {
                        op: "close",
                        timeout_ms,
                        cause: None,
                    }));
                },
            );
            let dispatched = self
                .shared
                .dispatcher
                .dispatch("close", |reactor| reactor.initiate_close());
            if dispatched.is_err() {
                // Reactor already gone; nothing left to close.
                self.shared.close_result.send_if_modified(|slot| {
                    if slot.is_none() {
                        *slot = Some(Ok(()));
                        true
                    } else {
                        false
                    }
                });
            }
        }

        let mut rx = self.shared.close_result.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                self.shared.management.close().await;
                self.abort_background();
                return result;
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    fn throw_if_closed(&self) -> Result<()> {
        if self.shared.is_closing() {
            Err(self.shared.closed_error())
        } else {
            Ok(())
        }
    }

    fn require_session_id(&self) -> Result<String> {
        let session = self.shared.session.lock();
        if !session.enabled {
            return Err(ReceiverError::invalid_argument("not a session receiver"));
        }
        session
            .id
            .clone()
            .ok_or_else(|| ReceiverError::invalid_argument("session id not yet established"))
    }

    fn abort_background(&self) {
        if let Some(handle) = self.shared.reaper.lock().take() {
            handle.abort();
        }
        let _ = self
            .shared
            .dispatcher
            .dispatch("shutdown", |reactor| reactor.stopped = true);
    }
}

async fn run_reactor(
    mut reactor: Reactor,
    mut jobs: mpsc::UnboundedReceiver<Job<Reactor>>,
    mut events: mpsc::UnboundedReceiver<LinkEventEnvelope>,
) {
    loop {
        if reactor.stopped {
            break;
        }
        // Link events drain ahead of submitted jobs so a job dispatched
        // after a delivery observes that delivery in the prefetch queue.
        tokio::select! {
            biased;
            envelope = events.recv() => match envelope {
                Some(envelope) => reactor.on_link_event(envelope),
                None => break,
            },
            job = jobs.recv() => match job {
                Some(job) => job(&mut reactor),
                None => break,
            },
        }
    }
}

impl Reactor {
    fn on_link_event(&mut self, envelope: LinkEventEnvelope) {
        if envelope.epoch != self.link_epoch {
            debug!(
                path = %self.shared.path,
                epoch = envelope.epoch,
                current = self.link_epoch,
                "dropping event from a replaced link"
            );
            return;
        }
        match envelope.event {
            LinkEvent::OpenComplete { error } => self.on_open_complete(error.map(Into::into)),
            LinkEvent::Delivery { tag, pending } => self.on_new_delivery(tag, pending),
            LinkEvent::DispositionUpdate { tag, outcome } => {
                self.on_remote_disposition(tag, outcome)
            }
            LinkEvent::Closed { error } => self.on_closed(error),
        }
    }

    fn create_receive_link(&mut self) {
        self.link_epoch += 1;
        self.lifecycle = if self.open_waiter.is_some() {
            LinkLifecycle::Opening
        } else {
            LinkLifecycle::Reopening
        };

        let mut properties = ValueMap::new();
        properties.insert(
            LINK_TIMEOUT_PROPERTY.into(),
            Value::ULong(adjust_server_timeout(self.shared.operation_timeout).as_millis() as u64),
        );
        let mut filter = ValueMap::new();
        {
            let session = self.shared.session.lock();
            if session.enabled {
                let session_filter = match &session.id {
                    Some(id) => Value::from(id.as_str()),
                    None => Value::Null,
                };
                filter.insert(SESSION_FILTER.into(), session_filter);
                properties.insert(
                    LINK_PEEK_MODE_PROPERTY.into(),
                    Value::Bool(session.browsable),
                );
            }
        }

        let settings = LinkSettings {
            name: generate_link_name(self.shared.factory.remote_container()),
            source: Source {
                address: self.shared.path.clone(),
                filter,
            },
            properties,
            settle_mode: self.shared.settle_mode,
        };

        debug!(
            path = %self.shared.path,
            link = %settings.name,
            epoch = self.link_epoch,
            reopening = matches!(self.lifecycle, LinkLifecycle::Reopening),
            "creating receive link"
        );
        match self
            .shared
            .factory
            .open_receive_link(settings, self.events_tx.clone(), self.link_epoch)
        {
            Ok(link) => self.link = Some(link),
            Err(error) => self.handle_link_error(error.into()),
        }
    }

    fn ensure_link_open(&mut self) {
        let closed = match self.link.as_ref() {
            None => true,
            Some(link) => {
                link.local_state() == EndpointState::Closed
                    || link.remote_state() == EndpointState::Closed
            }
        };
        if closed && !self.shared.is_closing() {
            self.create_receive_link();
        }
    }

    fn fail_open_if_pending(&mut self, timeout_ms: u64) {
        if let Some(waiter) = self.open_waiter.take() {
            warn!(path = %self.shared.path, timeout_ms, "open timed out");
            self.lifecycle = LinkLifecycle::Closed;
            let _ = waiter.tx.send(Err(ReceiverError::Timeout {
                op: "open",
                timeout_ms,
                cause: self.shared.last_error_boxed(),
            }));
        }
    }

    fn on_open_complete(&mut self, error: Option<ReceiverError>) {
        let mut error = error;
        if error.is_none() {
            let (remote_source, remote_properties) = match self.link.as_ref() {
                Some(link) => (link.remote_source(), link.remote_properties()),
                None => (None, ValueMap::new()),
            };
            let mut session = self.shared.session.lock();
            if let Err(session_error) =
                session.confirm_open(remote_source.as_ref(), &remote_properties)
            {
                error = Some(session_error);
            }
        }

        match error {
            None => {
                if let Some(waiter) = self.open_waiter.take() {
                    waiter.timer.abort();
                    let _ = waiter.tx.send(Ok(()));
                }
                self.lifecycle = LinkLifecycle::Open;
                *self.shared.last_link_error.lock() = None;
                self.retry_attempts = 0;
                self.credit.reset();

                let prefetch_count = *self.shared.prefetch_count.lock();
                let refill = i64::from(prefetch_count) - self.prefetched.len() as i64;
                self.send_flow(refill);

                if let Some(link) = self.link.as_ref() {
                    let reference_id = link
                        .remote_properties()
                        .get(TRACKING_ID_PROPERTY)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| link.name().to_string());
                    let mut diagnostics = self.shared.diagnostics.lock();
                    diagnostics.opened = true;
                    diagnostics.reference_id = Some(reference_id);
                    diagnostics.link_credit = link.credit();
                    diagnostics.prefetched = self.prefetched.len();

                    info!(
                        path = %self.shared.path,
                        link = %link.name(),
                        credit = link.credit(),
                        "receive link open"
                    );
                }
            }
            Some(error) => {
                if let Some(waiter) = self.open_waiter.take() {
                    waiter.timer.abort();
                    self.lifecycle = LinkLifecycle::Closed;
                    self.shared.closing.store(true, Ordering::SeqCst);
                    warn!(path = %self.shared.path, error = %error, "open failed");
                    let _ = waiter.tx.send(Err(error.clone()));
                }
                *self.shared.last_link_error.lock() = Some(error);
            }
        }
    }

    fn on_new_delivery(&mut self, tag: DeliveryTag, pending: usize) {
        if !tag.is_empty() && self.registry.contains(&tag) {
            debug!(path = %self.shared.path, tag = %tag, "delivery event for a known tag, ignoring");
            return;
        }

        let sender_settled = self.shared.settle_mode.sender == SenderSettleMode::Settled;
        let decoded = {
            let Some(link) = self.link.as_mut() else {
                return;
            };
            let mut buf = vec![0u8; pending];
            let read = link.recv(&mut buf);
            match decode_message(&buf[..read]) {
                Ok(message) => {
                    if sender_settled {
                        // Delivery arrived settled by the sender; accept and
                        // settle locally, no registry entry.
                        link.disposition(&tag, &Outcome::Accepted);
                        link.settle(&tag);
                    } else {
                        link.advance();
                    }
                    Some(message)
                }
                Err(error) => {
                    warn!(path = %self.shared.path, tag = %tag, error = %error, "undecodable delivery");
                    link.disposition(
                        &tag,
                        &Outcome::Rejected {
                            error: Some(ErrorCondition::with_description(
                                CONDITION_INTERNAL_ERROR,
                                "payload decode failed",
                            )),
                        },
                    );
                    link.settle(&tag);
                    None
                }
            }
        };
        let Some(message) = decoded else { return };

        if !sender_settled {
            self.registry.insert(tag.clone());
        }
        self.prefetched.push(MessageWithDeliveryTag::new(message, tag));
        self.retry_attempts = 0;
        self.shared.diagnostics.lock().prefetched = self.prefetched.len();

        if let Some(mut head) = self.pending_receives.pop_front() {
            head.cancel_timer();
            let max_count = head.max_count();
            let messages = self.poll_prefetch(max_count);
            head.complete(messages);
        }
    }

    fn on_remote_disposition(&mut self, tag: DeliveryTag, outcome: Option<Outcome>) {
        // Only terminal outcomes matter.
        let Some(remote) = outcome else { return };
        let Some(intended) = self.shared.tracker.intended_outcome(&tag) else {
            return;
        };

        if intended.kind() == remote.kind() {
            self.complete_pending_update(&tag, None);
            return;
        }

        match remote {
            Outcome::Rejected { error } => {
                let error: ReceiverError = match error {
                    Some(condition) => condition.into(),
                    None => ReceiverError::Broker {
                        condition: CONDITION_INTERNAL_ERROR.into(),
                        description: "delivery rejected".into(),
                        transient: true,
                    },
                };
                if error.is_transient() {
                    *self.shared.last_link_error.lock() = Some(error.clone());
                }
                let remaining = self
                    .shared
                    .tracker
                    .remaining(&tag)
                    .unwrap_or(Duration::ZERO);
                match self
                    .shared
                    .retry
                    .next_retry_interval(&error, self.retry_attempts, remaining)
                {
                    None => self.complete_pending_update(&tag, Some(error)),
                    Some(delay) => {
                        self.shared.tracker.set_last_error(&tag, error);
                        self.retry_attempts += 1;
                        debug!(
                            path = %self.shared.path,
                            tag = %tag,
                            delay_ms = delay.as_millis() as u64,
                            "disposition rejected, scheduling retry"
                        );
                        let tag = tag.clone();
                        self.shared.dispatcher.dispatch_after(
                            delay,
                            "retryDisposition",
                            move |reactor| reactor.resend_disposition(&tag),
                        );
                    }
                }
            }
            Outcome::Released => {
                self.complete_pending_update(
                    &tag,
                    Some(ReceiverError::OperationCancelled {
                        description: "delivery released by the broker".into(),
                    }),
                );
            }
            other => {
                self.complete_pending_update(
                    &tag,
                    Some(ReceiverError::Broker {
                        condition: CONDITION_INTERNAL_ERROR.into(),
                        description: format!("unexpected outcome {other:?}"),
                        transient: false,
                    }),
                );
            }
        }
    }

    /// Re-issues the original disposition on the same delivery after a
    /// retryable rejection. Whether the broker accepts a repeated
    /// disposition on one transfer is broker-dependent.
    fn resend_disposition(&mut self, tag: &DeliveryTag) {
        let Some(outcome) = self.shared.tracker.intended_outcome(tag) else {
            return;
        };
        if let Some(link) = self.link.as_mut() {
            link.disposition(tag, &outcome);
        }
    }

    fn complete_pending_update(&mut self, tag: &DeliveryTag, error: Option<ReceiverError>) {
        if let Some(item) = self.shared.tracker.take(tag) {
            if let Some(link) = self.link.as_mut() {
                link.settle(tag);
            }
            self.registry.remove(tag);
            match error {
                None => item.complete(),
                Some(error) => item.fail(error),
            }
        }
    }

    fn on_closed(&mut self, error: Option<ErrorCondition>) {
        let error: ReceiverError = match error {
            Some(condition) => condition.into(),
            None => ReceiverError::Broker {
                condition: CONDITION_DETACH_FORCED.into(),
                description: format!("receive link to '{}' closed", self.shared.path),
                transient: true,
            },
        };
        self.handle_link_error(error);
    }

    fn handle_link_error(&mut self, error: ReceiverError) {
        self.prefetched.clear();
        self.shared.diagnostics.lock().prefetched = 0;

        if self.shared.is_closing() {
            self.lifecycle = LinkLifecycle::Closed;
            self.finish_close(Ok(()));
            self.clear_all_pending(&error);
            return;
        }

        *self.shared.last_link_error.lock() = Some(error.clone());
        if self.open_waiter.is_some() {
            self.on_open_complete(Some(error.clone()));
        }

        if !error.is_transient() {
            warn!(path = %self.shared.path, error = %error, "link failed");
            self.lifecycle = LinkLifecycle::Closed;
            self.clear_all_pending(&error);
            return;
        }

        self.lifecycle = LinkLifecycle::Reopening;
        if let Some(remaining) = self.pending_receives.head_remaining() {
            if let Some(delay) =
                self.shared
                    .retry
                    .next_retry_interval(&error, self.retry_attempts, remaining)
            {
                self.retry_attempts += 1;
                info!(
                    path = %self.shared.path,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "transient link error, scheduling reattach"
                );
                self.shared
                    .dispatcher
                    .dispatch_after(delay, "reattach", |reactor| {
                        if !reactor.shared.is_closing() {
                            reactor.ensure_link_open();
                        }
                    });
            }
        }
    }

    fn handle_receive(
        &mut self,
        tx: oneshot::Sender<Result<Vec<MessageWithDeliveryTag>>>,
        max_count: u32,
        timeout: Duration,
    ) {
        self.ensure_link_open();

        let messages = self.poll_prefetch(max_count);
        if !messages.is_empty() {
            let _ = tx.send(Ok(messages));
            return;
        }

        let id = self.next_receive_id;
        self.next_receive_id += 1;
        let timer = self
            .shared
            .dispatcher
            .dispatch_after(timeout, "receiveTimeout", move |reactor| {
                reactor.expire_receive(id)
            });
        self.pending_receives
            .push_back(ReceiveWorkItem::new(id, tx, max_count, timeout, timer));
    }

    fn expire_receive(&mut self, id: u64) {
        if let Some(item) = self.pending_receives.remove(id) {
            // Zero-credit flow nudges the remote endpoint; workaround for a
            // broker that sometimes sits on its flow state.
            if let Some(link) = self.link.as_mut() {
                link.flow(0);
            }
            item.complete(Vec::new());
        }
    }

    fn handle_update_state(
        &mut self,
        tag: DeliveryTag,
        outcome: Outcome,
        tx: oneshot::Sender<Result<()>>,
        timeout: Duration,
    ) {
        self.ensure_link_open();

        if !self.registry.contains(&tag) {
            let _ = tx.send(Err(ReceiverError::DeliveryNotFound));
            return;
        }

        let item = UpdateStateWorkItem::new(tx, outcome.clone(), timeout);
        match self.shared.tracker.try_insert(tag.clone(), item) {
            Ok(()) => {
                if let Some(link) = self.link.as_mut() {
                    link.disposition(&tag, &outcome);
                }
            }
            Err(item) => item.fail(ReceiverError::invalid_argument(
                "a disposition is already pending for this delivery",
            )),
        }
    }

    /// Drains up to `max_count` prefetched messages, replenishing one credit
    /// per message handed out.
    fn poll_prefetch(&mut self, max_count: u32) -> Vec<MessageWithDeliveryTag> {
        let mut messages = Vec::new();
        while messages.len() < max_count as usize {
            match self.prefetched.poll() {
                Some(message) => {
                    messages.push(message);
                    self.send_flow(1);
                }
                None => break,
            }
        }
        if !messages.is_empty() {
            self.shared.diagnostics.lock().prefetched = self.prefetched.len();
        }
        messages
    }

    fn send_flow(&mut self, credits: i64) {
        let prefetch_count = *self.shared.prefetch_count.lock();
        match self.link.as_mut() {
            Some(link) => {
                if let Some(flowed) = self.credit.enqueue(link.as_mut(), prefetch_count, credits) {
                    debug!(
                        path = %self.shared.path,
                        link = %link.name(),
                        sent_credits = flowed,
                        link_credit = link.credit(),
                        "issued flow"
                    );
                    self.shared.diagnostics.lock().link_credit = link.credit();
                }
            }
            None => self.credit.accumulate(credits),
        }
    }

    fn initiate_close(&mut self) {
        match self.link.as_mut() {
            Some(link) if link.local_state() != EndpointState::Closed => {
                info!(path = %self.shared.path, link = %link.name(), "closing receive link");
                link.close();
            }
            _ => {
                self.lifecycle = LinkLifecycle::Closed;
                self.finish_close(Ok(()));
                self.clear_all_pending(&ReceiverError::Broker {
                    condition: CONDITION_DETACH_FORCED.into(),
                    description: format!("receive link to '{}' closed", self.shared.path),
                    transient: true,
                });
            }
        }
    }

    fn finish_close(&mut self, result: Result<()>) {
        self.shared.close_result.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// Fans a link-level failure out to every pending work item. Transient
    /// failures complete receives with an empty batch; dispositions always
    /// fail.
    fn clear_all_pending(&mut self, error: &ReceiverError) {
        let transient = error.is_transient();
        for mut item in self.pending_receives.drain() {
            item.cancel_timer();
            if transient {
                item.complete(Vec::new());
            } else {
                item.fail(error.clone());
            }
        }
        for (_, item) in self.shared.tracker.drain() {
            item.fail(error.clone());
        }
        self.registry.clear();
    }
}

fn generate_link_name(remote_container: Option<String>) -> String {
    let prefix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    match remote_container {
        Some(container) if !container.is_empty() => {
            format!("{prefix}{TRACKING_ID_TOKEN_SEPARATOR}{container}")
        }
        _ => prefix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ferrobus_amqp::constants::CONDITION_NOT_FOUND;
    use ferrobus_amqp::mock::{MockFactory, OpenBehavior};
    use ferrobus_amqp::time::system_time_to_ticks;
    use std::time::UNIX_EPOCH;

    fn options() -> ReceiverOptions {
        ReceiverOptions::default().with_prefetch_count(10)
    }

    async fn open_receiver(factory: &MockFactory) -> MessageReceiver {
        MessageReceiver::create(
            Arc::new(factory.clone()),
            "recv-1",
            "queue-1",
            options(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_opens_link_and_issues_prefetch_credit() {
        let factory = MockFactory::new();
        let receiver = open_receiver(&factory).await;

        let link = factory.link();
        assert_eq!(link.credit(), 10);
        assert!(link.link_name().ends_with("_mock-container"));

        let settings = link.settings();
        assert_eq!(settings.source.address, "queue-1");
        assert!(settings
            .properties
            .get(LINK_TIMEOUT_PROPERTY)
            .and_then(Value::as_u64)
            .is_some());

        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_failure_surfaces_broker_error() {
        let factory = MockFactory::new();
        factory.set_open_behavior(OpenBehavior::Fail(ErrorCondition::with_description(
            CONDITION_NOT_FOUND,
            "no such entity",
        )));

        let err = MessageReceiver::create(
            Arc::new(factory.clone()),
            "recv-1",
            "missing",
            options(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReceiverError::Broker { condition, .. } if condition == CONDITION_NOT_FOUND));
    }

    #[tokio::test]
    async fn open_timeout_fails_the_create() {
        let factory = MockFactory::new();
        factory.set_open_behavior(OpenBehavior::Manual);

        let err = MessageReceiver::create(
            Arc::new(factory.clone()),
            "recv-1",
            "queue-1",
            options().with_operation_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReceiverError::Timeout { op: "open", .. }));
    }

    #[tokio::test]
    async fn session_receiver_without_filter_echo_fails_open() {
        let factory = MockFactory::new();
        factory.set_echo_filter(false);

        let err = MessageReceiver::create_session(
            Arc::new(factory.clone()),
            "recv-1",
            "queue-1",
            Some("s1".into()),
            false,
            options(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReceiverError::SessionFilterMissing));
    }

    #[tokio::test]
    async fn session_open_decodes_locked_until_and_issues_credit() {
        let factory = MockFactory::new();
        let locked_until = UNIX_EPOCH + Duration::from_secs(1_900_000_000);
        let mut properties = ValueMap::new();
        properties.insert(
            ferrobus_amqp::constants::LOCKED_UNTIL_UTC.into(),
            Value::Long(system_time_to_ticks(locked_until)),
        );
        factory.set_remote_properties(properties);

        let receiver = MessageReceiver::create_session(
            Arc::new(factory.clone()),
            "recv-1",
            "queue-1",
            Some("S1".into()),
            false,
            options(),
        )
        .await
        .unwrap();

        assert_eq!(receiver.session_id().as_deref(), Some("S1"));
        assert_eq!(receiver.session_locked_until().unwrap(), Some(locked_until));
        assert_eq!(factory.link().credit(), 10);

        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn browsable_session_never_issues_credit() {
        let factory = MockFactory::new();
        let receiver = MessageReceiver::create_session(
            Arc::new(factory.clone()),
            "recv-1",
            "queue-1",
            Some("s1".into()),
            true,
            options(),
        )
        .await
        .unwrap();

        let link = factory.link();
        assert_eq!(link.credit(), 0);
        assert!(link.flow_history().is_empty());
        assert_eq!(
            link.settings().properties.get(LINK_PEEK_MODE_PROPERTY),
            Some(&Value::Bool(true))
        );

        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn receive_rejects_invalid_max_count() {
        let factory = MockFactory::new();
        let receiver = open_receiver(&factory).await;

        let err = receiver.receive(0).await.unwrap_err();
        assert!(matches!(err, ReceiverError::InvalidArgument { .. }));
        let err = receiver.receive(11).await.unwrap_err();
        assert!(matches!(err, ReceiverError::InvalidArgument { .. }));

        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn receive_timeout_resolves_empty_and_nudges_flow() {
        let factory = MockFactory::new();
        let receiver = open_receiver(&factory).await;

        let messages = receiver
            .receive_with_timeout(1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(messages.is_empty());
        // The prefetch flow plus the zero-credit nudge.
        assert_eq!(factory.link().flow_history(), vec![10, 0]);

        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let factory = MockFactory::new();
        let receiver = open_receiver(&factory).await;

        receiver.close().await.unwrap();
        receiver.close().await.unwrap();
        assert!(factory.link().is_locally_closed());

        let err = receiver.receive(1).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Closed { .. }));
    }

    #[tokio::test]
    async fn disposition_on_unknown_tag_fails() {
        let factory = MockFactory::new();
        let receiver = open_receiver(&factory).await;

        let err = receiver
            .complete(&DeliveryTag::new(Bytes::from_static(b"nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::DeliveryNotFound));

        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn error_context_reports_link_state_after_open() {
        let factory = MockFactory::new();
        let receiver = open_receiver(&factory).await;

        let context = receiver.error_context();
        assert_eq!(context.endpoint, "mock://localhost");
        assert_eq!(context.path, "queue-1");
        assert_eq!(context.prefetch_count, Some(10));
        assert_eq!(context.link_credit, Some(10));
        assert_eq!(context.prefetched_message_count, Some(0));
        assert!(context.reference_id.is_some());

        receiver.close().await.unwrap();
    }
}
