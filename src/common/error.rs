use super::clock::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("vector clocks differ in size: local has {local} entries, other has {other}")]
    SizeMismatch { local: usize, other: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("couldn't parse amount: {0:?}")]
    MalformedAmount(String),

    #[error("message {0} carries no recorded logs")]
    MissingAttachment(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no link to servent {0}")]
    UnknownPeer(NodeId),

    #[error("link to servent {0} is closed")]
    LinkClosed(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("tried to start collecting before finished with previous")]
    AlreadyCollecting,

    #[error("a snapshot is already active on this servent")]
    AlreadyActive,

    #[error("snapshot collector is stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ServentError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
