use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("unsupported DWC3 core id {0:#010x}")]
    UnknownCore(u32),
    #[error("register layout mismatch: {what} is {found:#x}, expected {expected:#x}")]
    RegisterLayout {
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("controller is running, it must be halted first")]
    NotHalted,
    #[error("out of DMA memory ({0} bytes requested)")]
    OutOfMemory(usize),
    #[error("no free {0}")]
    Exhausted(&'static str),
    #[error("new device queue is full")]
    QueueFull,
    #[error("slot {0} is not in use")]
    NoSuchSlot(u8),
    #[error("pipe {0} is not open")]
    NoSuchPipe(usize),
    #[error("invalid endpoint address {0:#04x}")]
    InvalidEndpoint(u8),
    #[error("invalid port {0}")]
    InvalidPort(u8),
    #[error("route string overflow at hub depth {0}")]
    RouteTooDeep(u8),
    #[error("transfer of {length} bytes exceeds the limit of {limit}")]
    TransferTooLarge { length: usize, limit: usize },
    #[error("a data transfer needs a completion to release its buffer")]
    CompletionRequired,
    #[error("normal transfers need a payload")]
    EmptyTransfer,
    #[error("operation is not valid on this pipe type")]
    WrongPipeKind,
    #[error("malformed {0} descriptor")]
    BadDescriptor(&'static str),
    #[error("transfer completion was dropped")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
