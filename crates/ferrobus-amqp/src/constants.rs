//! Protocol and vendor constants.
//!
//! Property keys, filter names, management operation names, and status codes
//! used on the wire. Vendor-prefixed keys follow the broker's dialect.

/// Link property carrying the server-side operation timeout in milliseconds.
pub const LINK_TIMEOUT_PROPERTY: &str = "com.microsoft:timeout";
/// Link property marking a browsable (peek-only) session receiver.
pub const LINK_PEEK_MODE_PROPERTY: &str = "com.microsoft:peek-mode";
/// Source filter key selecting a named session.
pub const SESSION_FILTER: &str = "com.microsoft:session-filter";
/// Remote link property carrying the session lock expiry as broker ticks.
pub const LOCKED_UNTIL_UTC: &str = "com.microsoft:locked-until-utc";
/// Remote link property carrying the broker-side tracking id.
pub const TRACKING_ID_PROPERTY: &str = "com.microsoft:tracking-id";

/// Suffix of the management node paired with an entity path.
pub const MANAGEMENT_NODE_SUFFIX: &str = "$management";
/// Separator between the random link-name prefix and the remote container id.
pub const TRACKING_ID_TOKEN_SEPARATOR: &str = "_";

/// Application property naming the management operation.
pub const MANAGEMENT_OPERATION_KEY: &str = "operation";
/// Application property carrying the server-side timeout for a management request.
pub const MANAGEMENT_SERVER_TIMEOUT_KEY: &str = "com.microsoft:server-timeout";
/// Application property carrying the response status code.
pub const MANAGEMENT_STATUS_CODE_KEY: &str = "statusCode";
/// Application property carrying the response status description.
pub const MANAGEMENT_STATUS_DESCRIPTION_KEY: &str = "statusDescription";
/// Application property carrying the response error condition.
pub const MANAGEMENT_ERROR_CONDITION_KEY: &str = "errorCondition";
/// Status code of a successful management response.
pub const MANAGEMENT_STATUS_OK: i64 = 200;
/// Status code of a successful management response with no content.
pub const MANAGEMENT_STATUS_NO_CONTENT: i64 = 204;

/// Management operation: renew message locks.
pub const OPERATION_RENEW_LOCK: &str = "com.microsoft:renew-lock";
/// Management operation: receive deferred messages by sequence number.
pub const OPERATION_RECEIVE_BY_SEQUENCE_NUMBER: &str = "com.microsoft:receive-by-sequence-number";
/// Management operation: update disposition by lock token.
pub const OPERATION_UPDATE_DISPOSITION: &str = "com.microsoft:update-disposition";
/// Management operation: renew a session lock.
pub const OPERATION_RENEW_SESSION_LOCK: &str = "com.microsoft:renew-session-lock";
/// Management operation: read session state.
pub const OPERATION_GET_SESSION_STATE: &str = "com.microsoft:get-session-state";
/// Management operation: write session state.
pub const OPERATION_SET_SESSION_STATE: &str = "com.microsoft:set-session-state";
/// Management operation: peek messages without locking them.
pub const OPERATION_PEEK_MESSAGE: &str = "com.microsoft:peek-message";

/// Request body key: lock tokens under operation.
pub const KEY_LOCK_TOKENS: &str = "lock-tokens";
/// Request body key: sequence numbers to fetch.
pub const KEY_SEQUENCE_NUMBERS: &str = "sequence-numbers";
/// Request body key: receiver settle mode (0 = first, 1 = second).
pub const KEY_RECEIVER_SETTLE_MODE: &str = "receiver-settle-mode";
/// Request body key: session id scope.
pub const KEY_SESSION_ID: &str = "session-id";
/// Request body key: requested disposition status.
pub const KEY_DISPOSITION_STATUS: &str = "disposition-status";
/// Request body key: dead-letter reason.
pub const KEY_DEADLETTER_REASON: &str = "deadletter-reason";
/// Request body key: dead-letter description.
pub const KEY_DEADLETTER_DESCRIPTION: &str = "deadletter-description";
/// Request body key: message annotations to merge on abandon/defer.
pub const KEY_PROPERTIES_TO_MODIFY: &str = "properties-to-modify";
/// Request body key: first sequence number to peek from.
pub const KEY_FROM_SEQUENCE_NUMBER: &str = "from-sequence-number";
/// Request body key: number of messages to peek.
pub const KEY_MESSAGE_COUNT: &str = "message-count";
/// Request/response body key: opaque session state.
pub const KEY_SESSION_STATE: &str = "session-state";
/// Response body key: per-token lock expirations.
pub const KEY_EXPIRATIONS: &str = "expirations";
/// Response body key: session lock expiration.
pub const KEY_EXPIRATION: &str = "expiration";
/// Response body key: list of returned messages.
pub const KEY_MESSAGES: &str = "messages";
/// Response body key: one encoded message payload.
pub const KEY_MESSAGE: &str = "message";
/// Response body key: lock token paired with a returned message.
pub const KEY_LOCK_TOKEN: &str = "lock-token";

/// Disposition status value: complete.
pub const DISPOSITION_STATUS_COMPLETED: &str = "completed";
/// Disposition status value: abandon.
pub const DISPOSITION_STATUS_ABANDONED: &str = "abandoned";
/// Disposition status value: defer.
pub const DISPOSITION_STATUS_DEFERRED: &str = "deferred";
/// Disposition status value: dead-letter.
pub const DISPOSITION_STATUS_SUSPENDED: &str = "suspended";

/// Error condition used on the rejected outcome when dead-lettering.
pub const DEAD_LETTER_NAME: &str = "com.microsoft:dead-letter";
/// Dead-letter info key: reason.
pub const DEADLETTER_REASON_HEADER: &str = "DeadLetterReason";
/// Dead-letter info key: description.
pub const DEADLETTER_DESCRIPTION_HEADER: &str = "DeadLetterErrorDescription";

/// Condition: unspecified internal error.
pub const CONDITION_INTERNAL_ERROR: &str = "amqp:internal-error";
/// Condition: addressed node does not exist.
pub const CONDITION_NOT_FOUND: &str = "amqp:not-found";
/// Condition: link was detached by the peer.
pub const CONDITION_DETACH_FORCED: &str = "amqp:link:detach-forced";
/// Condition: connection was closed by the peer.
pub const CONDITION_CONNECTION_FORCED: &str = "amqp:connection:forced";
/// Condition: resource limit was exceeded.
pub const CONDITION_RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
/// Condition: broker-side operation timeout.
pub const CONDITION_TIMEOUT: &str = "com.microsoft:timeout";
/// Condition: broker is temporarily overloaded.
pub const CONDITION_SERVER_BUSY: &str = "com.microsoft:server-busy";
/// Condition: broker cancelled the operation.
pub const CONDITION_OPERATION_CANCELLED: &str = "com.microsoft:operation-cancelled";
/// Condition: entity has been administratively disabled.
pub const CONDITION_ENTITY_DISABLED: &str = "com.microsoft:entity-disabled";
/// Condition: the message lock was lost.
pub const CONDITION_MESSAGE_LOCK_LOST: &str = "com.microsoft:message-lock-lost";
/// Condition: the session lock was lost.
pub const CONDITION_SESSION_LOCK_LOST: &str = "com.microsoft:session-lock-lost";
/// Condition: the session is locked by another receiver.
pub const CONDITION_SESSION_CANNOT_BE_LOCKED: &str = "com.microsoft:session-cannot-be-locked";

/// Whether a condition names a transient failure that is worth retrying.
pub fn is_transient_condition(condition: &str) -> bool {
    matches!(
        condition,
        CONDITION_INTERNAL_ERROR
            | CONDITION_DETACH_FORCED
            | CONDITION_CONNECTION_FORCED
            | CONDITION_TIMEOUT
            | CONDITION_SERVER_BUSY
    )
}
