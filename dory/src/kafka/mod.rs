pub mod metadata;
pub mod produce;

/// Kafka protocol error codes, as defined at
/// https://kafka.apache.org/protocol. Only the codes a produce or metadata
/// response can carry matter here; anything undocumented is treated as
/// permanent.
pub mod error_code {
    pub const UNKNOWN: i16 = -1;
    pub const NONE: i16 = 0;
    pub const CORRUPT_MESSAGE: i16 = 2;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_FOR_PARTITION: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const BROKER_NOT_AVAILABLE: i16 = 8;
    pub const REPLICA_NOT_AVAILABLE: i16 = 9;
    pub const MESSAGE_TOO_LARGE: i16 = 10;
    pub const NETWORK_EXCEPTION: i16 = 13;
    pub const INVALID_TOPIC: i16 = 17;
    pub const RECORD_LIST_TOO_LARGE: i16 = 18;
    pub const NOT_ENOUGH_REPLICAS: i16 = 19;
    pub const NOT_ENOUGH_REPLICAS_AFTER_APPEND: i16 = 20;
    pub const INVALID_REQUIRED_ACKS: i16 = 21;
    pub const TOPIC_AUTHORIZATION_FAILED: i16 = 29;
    pub const CLUSTER_AUTHORIZATION_FAILED: i16 = 31;
    pub const NOT_CONTROLLER: i16 = 41;
    pub const INVALID_REQUEST: i16 = 42;
    pub const UNSUPPORTED_FOR_MESSAGE_FORMAT: i16 = 43;
}

/// What to do with the messages of a partition after a produce ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// Delivered; mark processed and free.
    Ok,
    /// Transient failure; requeue at the head of the send-wait queue.
    Resend,
    /// Permanent failure; discard as ProduceErr.
    Discard,
    /// Broker topology or availability is off; pause and rebalance.
    Pause,
    /// The messages are unacceptable and the broker is suspect.
    DiscardAndPause,
}

/// Fixed mapping from a per-partition produce error code to the action the
/// connector takes. Transient timeouts retry in place; leadership and
/// availability codes force a metadata refresh and reroute; size,
/// validity and authorization codes (and anything undocumented) drop the
/// messages rather than loop on them.
pub fn ack_action(error_code: i16) -> AckAction {
    use self::error_code as ec;

    match error_code {
        ec::NONE => AckAction::Ok,

        ec::CORRUPT_MESSAGE | ec::REQUEST_TIMED_OUT | ec::NETWORK_EXCEPTION => AckAction::Resend,

        ec::UNKNOWN_TOPIC_OR_PARTITION
        | ec::LEADER_NOT_AVAILABLE
        | ec::NOT_LEADER_FOR_PARTITION
        | ec::BROKER_NOT_AVAILABLE
        | ec::REPLICA_NOT_AVAILABLE
        | ec::NOT_ENOUGH_REPLICAS
        | ec::NOT_ENOUGH_REPLICAS_AFTER_APPEND
        | ec::NOT_CONTROLLER => AckAction::Pause,

        ec::TOPIC_AUTHORIZATION_FAILED | ec::CLUSTER_AUTHORIZATION_FAILED => {
            AckAction::DiscardAndPause
        }

        _ => AckAction::Discard,
    }
}

pub fn error_name(error_code: i16) -> &'static str {
    use self::error_code as ec;

    match error_code {
        ec::UNKNOWN => "Unknown",
        ec::NONE => "None",
        ec::CORRUPT_MESSAGE => "CorruptMessage",
        ec::UNKNOWN_TOPIC_OR_PARTITION => "UnknownTopicOrPartition",
        ec::LEADER_NOT_AVAILABLE => "LeaderNotAvailable",
        ec::NOT_LEADER_FOR_PARTITION => "NotLeaderForPartition",
        ec::REQUEST_TIMED_OUT => "RequestTimedOut",
        ec::BROKER_NOT_AVAILABLE => "BrokerNotAvailable",
        ec::REPLICA_NOT_AVAILABLE => "ReplicaNotAvailable",
        ec::MESSAGE_TOO_LARGE => "MessageTooLarge",
        ec::NETWORK_EXCEPTION => "NetworkException",
        ec::INVALID_TOPIC => "InvalidTopic",
        ec::RECORD_LIST_TOO_LARGE => "RecordListTooLarge",
        ec::NOT_ENOUGH_REPLICAS => "NotEnoughReplicas",
        ec::NOT_ENOUGH_REPLICAS_AFTER_APPEND => "NotEnoughReplicasAfterAppend",
        ec::INVALID_REQUIRED_ACKS => "InvalidRequiredAcks",
        ec::TOPIC_AUTHORIZATION_FAILED => "TopicAuthorizationFailed",
        ec::CLUSTER_AUTHORIZATION_FAILED => "ClusterAuthorizationFailed",
        ec::NOT_CONTROLLER => "NotController",
        ec::INVALID_REQUEST => "InvalidRequest",
        ec::UNSUPPORTED_FOR_MESSAGE_FORMAT => "UnsupportedForMessageFormat",
        _ => "Undocumented",
    }
}
