//! In-memory link endpoints for tests.
//!
//! `MockFactory` stands in for the connection layer the way `StubTransport`
//! stands in for the network elsewhere: it hands out scripted links and a
//! programmable management channel so the receiver core can be exercised
//! without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::condition::ErrorCondition;
use crate::constants::{MANAGEMENT_STATUS_CODE_KEY, MANAGEMENT_STATUS_DESCRIPTION_KEY};
use crate::error::{AmqpError, Result};
use crate::link::{
    EndpointState, LinkEvent, LinkEventEnvelope, LinkEvents, LinkFactory, LinkSettings,
    ReceiveLink, RequestResponseChannel, Source,
};
use crate::message::{encode_message, DeliveryTag, Message};
use crate::outcome::Outcome;
use crate::value::{Value, ValueMap};

/// How a mock link completes its open handshake.
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    /// Complete the handshake as soon as the link is created.
    Auto,
    /// Stay silent until the test calls [`MockLinkHandle::complete_open`].
    Manual,
    /// Fail the handshake with the given condition.
    Fail(ErrorCondition),
}

struct LinkState {
    name: String,
    epoch: u64,
    events: LinkEvents,
    settings: LinkSettings,
    local: EndpointState,
    remote: EndpointState,
    remote_source: Option<Source>,
    remote_properties: ValueMap,
    echo_filter: bool,
    filter_override: Option<ValueMap>,
    credit: u32,
    flows: Vec<u32>,
    inbound: VecDeque<Bytes>,
    advanced: u64,
    next_tag: u64,
    dispositions: HashMap<DeliveryTag, Vec<Outcome>>,
    settles: HashMap<DeliveryTag, u32>,
}

impl LinkState {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(LinkEventEnvelope {
            epoch: self.epoch,
            event,
        });
    }

    fn complete_open(&mut self) {
        self.remote = EndpointState::Active;
        let filter = match &self.filter_override {
            Some(filter) => filter.clone(),
            None if self.echo_filter => self.settings.source.filter.clone(),
            None => ValueMap::new(),
        };
        self.remote_source = Some(Source {
            address: self.settings.source.address.clone(),
            filter,
        });
        self.emit(LinkEvent::OpenComplete { error: None });
    }

    fn fail_open(&mut self, error: ErrorCondition) {
        self.remote = EndpointState::Closed;
        self.emit(LinkEvent::OpenComplete { error: Some(error) });
    }
}

/// The link object handed to the receiver core. The name is kept outside the
/// mutex because `ReceiveLink::name` hands out a borrowed slice.
struct MockLink {
    name: String,
    state: Arc<Mutex<LinkState>>,
}

impl ReceiveLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_state(&self) -> EndpointState {
        self.state.lock().local
    }

    fn remote_state(&self) -> EndpointState {
        self.state.lock().remote
    }

    fn remote_source(&self) -> Option<Source> {
        self.state.lock().remote_source.clone()
    }

    fn remote_properties(&self) -> ValueMap {
        self.state.lock().remote_properties.clone()
    }

    fn credit(&self) -> u32 {
        self.state.lock().credit
    }

    fn flow(&mut self, credit: u32) {
        let mut state = self.state.lock();
        state.credit = state.credit.saturating_add(credit);
        state.flows.push(credit);
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        match state.inbound.pop_front() {
            Some(payload) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                n
            }
            None => 0,
        }
    }

    fn advance(&mut self) {
        self.state.lock().advanced += 1;
    }

    fn disposition(&mut self, tag: &DeliveryTag, outcome: &Outcome) {
        self.state
            .lock()
            .dispositions
            .entry(tag.clone())
            .or_default()
            .push(outcome.clone());
    }

    fn settle(&mut self, tag: &DeliveryTag) {
        let mut state = self.state.lock();
        *state.settles.entry(tag.clone()).or_insert(0) += 1;
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.local = EndpointState::Closed;
        state.remote = EndpointState::Closed;
        state.emit(LinkEvent::Closed { error: None });
    }
}

/// Test-side controller for one mock link instance.
#[derive(Clone)]
pub struct MockLinkHandle {
    state: Arc<Mutex<LinkState>>,
}

impl MockLinkHandle {
    /// Completes the open handshake (for [`OpenBehavior::Manual`]).
    pub fn complete_open(&self) {
        self.state.lock().complete_open();
    }

    /// Fails the open handshake with `error`.
    pub fn fail_open(&self, error: ErrorCondition) {
        self.state.lock().fail_open(error);
    }

    /// Delivers a message, consuming one credit, and returns its tag.
    pub fn deliver(&self, message: &Message) -> DeliveryTag {
        let payload = encode_message(message).expect("mock message encodes");
        self.deliver_raw(Bytes::from(payload))
    }

    /// Delivers a raw payload (which may not decode) and returns its tag.
    pub fn deliver_raw(&self, payload: Bytes) -> DeliveryTag {
        let mut state = self.state.lock();
        let tag = DeliveryTag::new(format!("d{}", state.next_tag).into_bytes());
        state.next_tag += 1;
        state.credit = state.credit.saturating_sub(1);
        state.inbound.push_back(payload.clone());
        state.emit(LinkEvent::Delivery {
            tag: tag.clone(),
            pending: payload.len(),
        });
        tag
    }

    /// Reports a terminal remote outcome for a previously sent disposition.
    pub fn remote_outcome(&self, tag: &DeliveryTag, outcome: Outcome) {
        self.state.lock().emit(LinkEvent::DispositionUpdate {
            tag: tag.clone(),
            outcome: Some(outcome),
        });
    }

    /// Reports a non-terminal state change for a delivery.
    pub fn remote_non_terminal(&self, tag: &DeliveryTag) {
        self.state.lock().emit(LinkEvent::DispositionUpdate {
            tag: tag.clone(),
            outcome: None,
        });
    }

    /// Closes the link from the remote side.
    pub fn remote_close(&self, error: Option<ErrorCondition>) {
        let mut state = self.state.lock();
        state.remote = EndpointState::Closed;
        state.local = EndpointState::Closed;
        state.emit(LinkEvent::Closed { error });
    }

    /// The link name the receiver opened this instance with.
    pub fn link_name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// The settings the receiver opened this instance with.
    pub fn settings(&self) -> LinkSettings {
        self.state.lock().settings.clone()
    }

    /// Credit currently granted by the receiver.
    pub fn credit(&self) -> u32 {
        self.state.lock().credit
    }

    /// How many deliveries the receiver advanced past (kept unsettled).
    pub fn advanced_count(&self) -> u64 {
        self.state.lock().advanced
    }

    /// Every flow the receiver issued, in order (including `flow(0)` nudges).
    pub fn flow_history(&self) -> Vec<u32> {
        self.state.lock().flows.clone()
    }

    /// Dispositions the receiver sent for `tag`, in order.
    pub fn dispositions(&self, tag: &DeliveryTag) -> Vec<Outcome> {
        self.state
            .lock()
            .dispositions
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    /// How many times the receiver settled `tag`.
    pub fn settle_count(&self, tag: &DeliveryTag) -> u32 {
        self.state.lock().settles.get(tag).copied().unwrap_or(0)
    }

    /// Whether the receiver closed the link locally.
    pub fn is_locally_closed(&self) -> bool {
        self.state.lock().local == EndpointState::Closed
    }
}

type Handler = Box<dyn FnMut(&Message) -> Message + Send>;

/// Programmable in-memory management endpoint.
pub struct MockManagementChannel {
    handler: Mutex<Handler>,
    requests: Mutex<Vec<Message>>,
    response_delay: Mutex<Option<Duration>>,
    closed: Mutex<bool>,
}

impl MockManagementChannel {
    fn new() -> Self {
        Self {
            handler: Mutex::new(Box::new(|_| management_response(200, ValueMap::new()))),
            requests: Mutex::new(Vec::new()),
            response_delay: Mutex::new(None),
            closed: Mutex::new(false),
        }
    }

    /// Replaces the request handler.
    pub fn set_handler(&self, handler: impl FnMut(&Message) -> Message + Send + 'static) {
        *self.handler.lock() = Box::new(handler);
    }

    /// Delays every response by `delay` (used to exercise request timeouts).
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.lock() = delay;
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().clone()
    }

    /// Whether the channel was closed by the receiver.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl RequestResponseChannel for MockManagementChannel {
    async fn request(&self, request: Message, timeout: Duration) -> Result<Message> {
        if *self.closed.lock() {
            return Err(AmqpError::ChannelClosed);
        }
        let delay = *self.response_delay.lock();
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(AmqpError::RequestTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().push(request.clone());
        let response = (self.handler.lock())(&request);
        Ok(response)
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }
}

/// Builds a management response with the given status code and body map.
pub fn management_response(status: i64, body: ValueMap) -> Message {
    let mut message = Message::with_map_body(body);
    message
        .application_properties
        .insert(MANAGEMENT_STATUS_CODE_KEY.into(), Value::Long(status));
    message
}

/// Builds a non-OK management response carrying a condition and description.
pub fn management_error_response(status: i64, condition: &str, description: &str) -> Message {
    let mut message = management_response(status, ValueMap::new());
    message.application_properties.insert(
        crate::constants::MANAGEMENT_ERROR_CONDITION_KEY.into(),
        Value::Symbol(condition.into()),
    );
    message.application_properties.insert(
        MANAGEMENT_STATUS_DESCRIPTION_KEY.into(),
        Value::String(description.into()),
    );
    message
}

struct FactoryState {
    remote_container: Option<String>,
    open_behavior: OpenBehavior,
    echo_filter: bool,
    filter_override: Option<ValueMap>,
    remote_properties: ValueMap,
    links: Vec<Arc<Mutex<LinkState>>>,
    management: Arc<MockManagementChannel>,
    management_paths: Vec<String>,
    fail_management_open: Option<ErrorCondition>,
}

/// In-memory stand-in for the connection layer.
#[derive(Clone)]
pub struct MockFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    /// A factory that auto-opens links and answers management requests with
    /// an empty OK response.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState {
                remote_container: Some("mock-container".into()),
                open_behavior: OpenBehavior::Auto,
                echo_filter: true,
                filter_override: None,
                remote_properties: ValueMap::new(),
                links: Vec::new(),
                management: Arc::new(MockManagementChannel::new()),
                management_paths: Vec::new(),
                fail_management_open: None,
            })),
        }
    }

    /// Sets how subsequently created links complete their open handshake.
    pub fn set_open_behavior(&self, behavior: OpenBehavior) {
        self.state.lock().open_behavior = behavior;
    }

    /// Sets the container id advertised to the receiver.
    pub fn set_remote_container(&self, container: Option<String>) {
        self.state.lock().remote_container = container;
    }

    /// Controls whether the remote source echoes the local filter map.
    pub fn set_echo_filter(&self, echo: bool) {
        self.state.lock().echo_filter = echo;
    }

    /// Overrides the filter map echoed on the remote source.
    pub fn set_remote_filter(&self, filter: Option<ValueMap>) {
        self.state.lock().filter_override = filter;
    }

    /// Sets the remote link properties (e.g. the locked-until ticks).
    pub fn set_remote_properties(&self, properties: ValueMap) {
        self.state.lock().remote_properties = properties;
    }

    /// Makes the next management channel open fail.
    pub fn fail_management_open(&self, error: Option<ErrorCondition>) {
        self.state.lock().fail_management_open = error;
    }

    /// Controller for the most recently opened link.
    ///
    /// Panics when no link has been opened yet.
    pub fn link(&self) -> MockLinkHandle {
        let state = self.state.lock();
        let link = state.links.last().expect("no link opened yet");
        MockLinkHandle { state: link.clone() }
    }

    /// How many link instances have been opened (reattaches create new ones).
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// The shared management endpoint.
    pub fn management(&self) -> Arc<MockManagementChannel> {
        self.state.lock().management.clone()
    }

    /// Paths management channels were requested for.
    pub fn management_paths(&self) -> Vec<String> {
        self.state.lock().management_paths.clone()
    }
}

#[async_trait]
impl LinkFactory for MockFactory {
    fn open_receive_link(
        &self,
        settings: LinkSettings,
        events: LinkEvents,
        epoch: u64,
    ) -> Result<Box<dyn ReceiveLink>> {
        let mut factory = self.state.lock();
        let mut link = LinkState {
            name: settings.name.clone(),
            epoch,
            events,
            settings,
            local: EndpointState::Active,
            remote: EndpointState::Uninitialized,
            remote_source: None,
            remote_properties: factory.remote_properties.clone(),
            echo_filter: factory.echo_filter,
            filter_override: factory.filter_override.clone(),
            credit: 0,
            flows: Vec::new(),
            inbound: VecDeque::new(),
            advanced: 0,
            next_tag: 0,
            dispositions: HashMap::new(),
            settles: HashMap::new(),
        };
        match factory.open_behavior.clone() {
            OpenBehavior::Auto => link.complete_open(),
            OpenBehavior::Manual => {}
            OpenBehavior::Fail(error) => link.fail_open(error),
        }
        let name = link.name.clone();
        let state = Arc::new(Mutex::new(link));
        factory.links.push(state.clone());
        Ok(Box::new(MockLink { name, state }))
    }

    async fn open_request_response_channel(
        &self,
        path: &str,
    ) -> Result<Arc<dyn RequestResponseChannel>> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_management_open.take() {
            return Err(AmqpError::Condition(error));
        }
        state.management_paths.push(path.to_string());
        Ok(state.management.clone())
    }

    fn remote_container(&self) -> Option<String> {
        self.state.lock().remote_container.clone()
    }

    fn endpoint(&self) -> String {
        "mock://localhost".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn settings() -> LinkSettings {
        LinkSettings {
            name: "test-link".into(),
            source: Source {
                address: "queue-1".into(),
                filter: ValueMap::new(),
            },
            properties: ValueMap::new(),
            settle_mode: crate::link::SettleModePair::peek_lock(),
        }
    }

    #[tokio::test]
    async fn auto_open_emits_open_complete() {
        let factory = MockFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = factory.open_receive_link(settings(), tx, 1).unwrap();
        assert_eq!(link.remote_state(), EndpointState::Active);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.epoch, 1);
        assert!(matches!(
            envelope.event,
            LinkEvent::OpenComplete { error: None }
        ));
    }

    #[tokio::test]
    async fn deliver_consumes_credit_and_carries_payload() {
        let factory = MockFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = factory.open_receive_link(settings(), tx, 1).unwrap();
        let _ = rx.recv().await; // open

        link.flow(5);
        let handle = factory.link();
        assert_eq!(handle.credit(), 5);

        let message = Message::with_data(Bytes::from_static(b"abc"));
        let tag = handle.deliver(&message);
        assert_eq!(handle.credit(), 4);

        let envelope = rx.recv().await.unwrap();
        let pending = match envelope.event {
            LinkEvent::Delivery { tag: t, pending } => {
                assert_eq!(t, tag);
                pending
            }
            other => panic!("unexpected event {other:?}"),
        };

        let mut buf = vec![0u8; pending];
        let n = link.recv(&mut buf);
        assert_eq!(n, pending);
        assert_eq!(crate::message::decode_message(&buf[..n]).unwrap(), message);
    }

    #[tokio::test]
    async fn settle_counts_are_tracked_per_tag() {
        let factory = MockFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut link = factory.open_receive_link(settings(), tx, 1).unwrap();
        let handle = factory.link();

        let tag = DeliveryTag::new(Bytes::from_static(b"t1"));
        link.disposition(&tag, &Outcome::Accepted);
        link.settle(&tag);
        assert_eq!(handle.dispositions(&tag), vec![Outcome::Accepted]);
        assert_eq!(handle.settle_count(&tag), 1);
    }

    #[tokio::test]
    async fn management_channel_applies_handler() {
        let factory = MockFactory::new();
        let channel = factory
            .open_request_response_channel("queue-1/$management")
            .await
            .unwrap();
        factory.management().set_handler(|_| {
            let mut body = ValueMap::new();
            body.insert("echo".into(), Value::Bool(true));
            management_response(200, body)
        });

        let response = channel
            .request(Message::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            response.application_property(MANAGEMENT_STATUS_CODE_KEY),
            Some(&Value::Long(200))
        );
        assert_eq!(factory.management_paths(), vec!["queue-1/$management"]);
    }
}
