//! Management operations over the paired request/response channel.
//!
//! Lock renewal, deferred receive, disposition by lock token, session state,
//! and peek all go through the entity's management node. The channel is
//! created lazily, once, under a mutex; afterwards it is shared freely.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use ferrobus_amqp::constants::{
    is_transient_condition, CONDITION_INTERNAL_ERROR, CONDITION_NOT_FOUND, CONDITION_SERVER_BUSY,
    DISPOSITION_STATUS_ABANDONED, DISPOSITION_STATUS_COMPLETED, DISPOSITION_STATUS_DEFERRED,
    DISPOSITION_STATUS_SUSPENDED, KEY_DEADLETTER_DESCRIPTION, KEY_DEADLETTER_REASON,
    KEY_DISPOSITION_STATUS, KEY_EXPIRATION, KEY_EXPIRATIONS, KEY_FROM_SEQUENCE_NUMBER,
    KEY_LOCK_TOKEN, KEY_LOCK_TOKENS, KEY_MESSAGE, KEY_MESSAGES, KEY_MESSAGE_COUNT,
    KEY_PROPERTIES_TO_MODIFY, KEY_RECEIVER_SETTLE_MODE, KEY_SEQUENCE_NUMBERS, KEY_SESSION_ID,
    KEY_SESSION_STATE, MANAGEMENT_ERROR_CONDITION_KEY, MANAGEMENT_NODE_SUFFIX,
    MANAGEMENT_OPERATION_KEY, MANAGEMENT_SERVER_TIMEOUT_KEY, MANAGEMENT_STATUS_CODE_KEY,
    MANAGEMENT_STATUS_DESCRIPTION_KEY, MANAGEMENT_STATUS_OK, OPERATION_GET_SESSION_STATE,
    OPERATION_PEEK_MESSAGE, OPERATION_RECEIVE_BY_SEQUENCE_NUMBER, OPERATION_RENEW_LOCK,
    OPERATION_RENEW_SESSION_LOCK, OPERATION_SET_SESSION_STATE, OPERATION_UPDATE_DISPOSITION,
};
use ferrobus_amqp::link::{LinkFactory, ReceiverSettleMode, RequestResponseChannel};
use ferrobus_amqp::message::{decode_message, Message, MessageWithLockToken};
use ferrobus_amqp::time::adjust_server_timeout;
use ferrobus_amqp::value::{Value, ValueMap};

use crate::error::{ReceiverError, Result};

/// Disposition requested through the management channel for locked messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionStatus {
    /// Complete and remove the message.
    Completed,
    /// Release the lock and make the message available again.
    Abandoned,
    /// Move the message to the deferred set.
    Deferred,
    /// Move the message to the dead-letter subqueue.
    Suspended,
}

impl DispositionStatus {
    fn as_wire(self) -> &'static str {
        match self {
            DispositionStatus::Completed => DISPOSITION_STATUS_COMPLETED,
            DispositionStatus::Abandoned => DISPOSITION_STATUS_ABANDONED,
            DispositionStatus::Deferred => DISPOSITION_STATUS_DEFERRED,
            DispositionStatus::Suspended => DISPOSITION_STATUS_SUSPENDED,
        }
    }
}

pub(crate) struct ManagementClient {
    factory: Arc<dyn LinkFactory>,
    entity_path: String,
    operation_timeout: Duration,
    channel: Mutex<Option<Arc<dyn RequestResponseChannel>>>,
}

impl ManagementClient {
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        entity_path: String,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            entity_path,
            operation_timeout,
            channel: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Arc<dyn RequestResponseChannel>> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }
        let path = format!("{}/{}", self.entity_path, MANAGEMENT_NODE_SUFFIX);
        debug!(path = %path, "creating request/response channel");
        let channel = self
            .factory
            .open_request_response_channel(&path)
            .await
            .map_err(ReceiverError::from)?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Closes the channel if it was ever created.
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
        }
    }

    async fn request(&self, operation: &str, body: ValueMap) -> Result<ValueMap> {
        let channel = self.channel().await?;
        let request = build_request(operation, body, adjust_server_timeout(self.operation_timeout));
        let response = channel
            .request(request, self.operation_timeout)
            .await
            .map_err(ReceiverError::from)?;
        let status = status_code(&response)?;
        if status == MANAGEMENT_STATUS_OK {
            Ok(response.body_map().cloned().unwrap_or_default())
        } else {
            debug!(operation, status, "management request failed");
            Err(error_from_response(status, &response))
        }
    }

    pub async fn renew_message_locks(
        &self,
        lock_tokens: &[Uuid],
        session_id: Option<&str>,
    ) -> Result<Vec<SystemTime>> {
        let mut body = ValueMap::new();
        body.insert(KEY_LOCK_TOKENS.into(), uuid_array(lock_tokens));
        insert_session_id(&mut body, session_id);

        let response = self.request(OPERATION_RENEW_LOCK, body).await?;
        let expirations = response
            .get(KEY_EXPIRATIONS)
            .and_then(Value::as_array)
            .ok_or_else(|| missing_field(KEY_EXPIRATIONS))?;
        Ok(expirations
            .iter()
            .filter_map(Value::as_timestamp)
            .map(timestamp_to_system_time)
            .collect())
    }

    pub async fn receive_by_sequence_numbers(
        &self,
        sequence_numbers: &[i64],
        receiver_settle_mode: ReceiverSettleMode,
        session_id: Option<&str>,
    ) -> Result<Vec<MessageWithLockToken>> {
        let mut body = ValueMap::new();
        body.insert(
            KEY_SEQUENCE_NUMBERS.into(),
            Value::Array(sequence_numbers.iter().map(|n| Value::Long(*n)).collect()),
        );
        let settle_mode = match receiver_settle_mode {
            ReceiverSettleMode::First => 0u32,
            ReceiverSettleMode::Second => 1u32,
        };
        body.insert(KEY_RECEIVER_SETTLE_MODE.into(), Value::UInt(settle_mode));
        insert_session_id(&mut body, session_id);

        let response = self
            .request(OPERATION_RECEIVE_BY_SEQUENCE_NUMBER, body)
            .await?;
        parse_message_list(&response, true)
    }

    pub async fn update_disposition(
        &self,
        lock_tokens: &[Uuid],
        status: DispositionStatus,
        deadletter_reason: Option<&str>,
        deadletter_description: Option<&str>,
        properties_to_modify: Option<ValueMap>,
        session_id: Option<&str>,
    ) -> Result<()> {
        let mut body = ValueMap::new();
        body.insert(KEY_LOCK_TOKENS.into(), uuid_array(lock_tokens));
        body.insert(
            KEY_DISPOSITION_STATUS.into(),
            Value::String(status.as_wire().into()),
        );
        if let Some(reason) = deadletter_reason {
            body.insert(KEY_DEADLETTER_REASON.into(), Value::from(reason));
        }
        if let Some(description) = deadletter_description {
            body.insert(KEY_DEADLETTER_DESCRIPTION.into(), Value::from(description));
        }
        if let Some(properties) = properties_to_modify {
            if !properties.is_empty() {
                body.insert(KEY_PROPERTIES_TO_MODIFY.into(), Value::Map(properties));
            }
        }
        insert_session_id(&mut body, session_id);

        self.request(OPERATION_UPDATE_DISPOSITION, body).await?;
        Ok(())
    }

    pub async fn renew_session_lock(&self, session_id: &str) -> Result<SystemTime> {
        let mut body = ValueMap::new();
        body.insert(KEY_SESSION_ID.into(), Value::from(session_id));

        let response = self.request(OPERATION_RENEW_SESSION_LOCK, body).await?;
        let expiration = response
            .get(KEY_EXPIRATION)
            .and_then(Value::as_timestamp)
            .ok_or_else(|| missing_field(KEY_EXPIRATION))?;
        Ok(timestamp_to_system_time(expiration))
    }

    pub async fn get_session_state(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        let mut body = ValueMap::new();
        body.insert(KEY_SESSION_ID.into(), Value::from(session_id));

        let response = self.request(OPERATION_GET_SESSION_STATE, body).await?;
        Ok(response
            .get(KEY_SESSION_STATE)
            .and_then(Value::as_binary)
            .map(|state| state.to_vec()))
    }

    pub async fn set_session_state(
        &self,
        session_id: &str,
        session_state: Option<&[u8]>,
    ) -> Result<()> {
        let mut body = ValueMap::new();
        body.insert(KEY_SESSION_ID.into(), Value::from(session_id));
        let state = match session_state {
            Some(state) => Value::Binary(Bytes::copy_from_slice(state)),
            None => Value::Null,
        };
        body.insert(KEY_SESSION_STATE.into(), state);

        self.request(OPERATION_SET_SESSION_STATE, body).await?;
        Ok(())
    }

    pub async fn peek_messages(
        &self,
        from_sequence_number: i64,
        message_count: i32,
        session_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        let mut body = ValueMap::new();
        body.insert(
            KEY_FROM_SEQUENCE_NUMBER.into(),
            Value::Long(from_sequence_number),
        );
        body.insert(KEY_MESSAGE_COUNT.into(), Value::Int(message_count));
        insert_session_id(&mut body, session_id);

        let response = self.request(OPERATION_PEEK_MESSAGE, body).await?;
        Ok(parse_message_list(&response, false)?
            .into_iter()
            .map(|entry| entry.message)
            .collect())
    }
}

fn build_request(operation: &str, body: ValueMap, server_timeout: Duration) -> Message {
    let mut message = Message::with_map_body(body);
    message
        .application_properties
        .insert(MANAGEMENT_OPERATION_KEY.into(), Value::from(operation));
    message.application_properties.insert(
        MANAGEMENT_SERVER_TIMEOUT_KEY.into(),
        Value::ULong(server_timeout.as_millis() as u64),
    );
    message
}

fn status_code(response: &Message) -> Result<i64> {
    response
        .application_property(MANAGEMENT_STATUS_CODE_KEY)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            ReceiverError::Serialization("management response is missing a status code".into())
        })
}

fn error_from_response(status: i64, response: &Message) -> ReceiverError {
    let condition = response
        .application_property(MANAGEMENT_ERROR_CONDITION_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| match status {
            404 | 410 => CONDITION_NOT_FOUND.into(),
            503 => CONDITION_SERVER_BUSY.into(),
            _ => CONDITION_INTERNAL_ERROR.into(),
        });
    let description = response
        .application_property(MANAGEMENT_STATUS_DESCRIPTION_KEY)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ReceiverError::Broker {
        transient: is_transient_condition(&condition),
        condition,
        description,
    }
}

fn parse_message_list(body: &ValueMap, with_lock_tokens: bool) -> Result<Vec<MessageWithLockToken>> {
    let entries = match body.get(KEY_MESSAGES).and_then(Value::as_array) {
        Some(entries) => entries,
        None => return Ok(Vec::new()),
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(map) = entry.as_map() else { continue };
        let Some(payload) = map.get(KEY_MESSAGE).and_then(Value::as_binary) else {
            continue;
        };
        let message =
            decode_message(payload).map_err(|e| ReceiverError::Serialization(e.to_string()))?;
        let lock_token = if with_lock_tokens {
            map.get(KEY_LOCK_TOKEN)
                .and_then(Value::as_uuid)
                .unwrap_or(Uuid::nil())
        } else {
            Uuid::nil()
        };
        messages.push(MessageWithLockToken::new(message, lock_token));
    }
    Ok(messages)
}

fn uuid_array(tokens: &[Uuid]) -> Value {
    Value::Array(tokens.iter().map(|token| Value::Uuid(*token)).collect())
}

fn insert_session_id(body: &mut ValueMap, session_id: Option<&str>) {
    if let Some(session_id) = session_id {
        body.insert(KEY_SESSION_ID.into(), Value::from(session_id));
    }
}

fn timestamp_to_system_time(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(millis).unwrap_or(0))
}

fn missing_field(field: &str) -> ReceiverError {
    ReceiverError::Serialization(format!("management response is missing '{field}'"))
}
