use std::fmt;

/// Main error type for the conveyor scheduling engine
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Input validation errors (never retried by the engine)
    Validation(String),

    /// Entity lookup failures
    NotFound(String),

    /// Backing store errors (surfaced after internal retries)
    Store(crate::repository::StoreError),

    /// Cache layer errors
    Cache(crate::cache::CacheError),

    /// Dependency graph errors (cycles, unknown endpoints)
    Graph(crate::graph::GraphError),

    /// Ready-queue errors (band capacity exhausted)
    Queue(crate::queue::QueueError),

    /// Worker registry errors (validation, rate limiting, lifecycle)
    Registry(crate::registry::RegistryError),

    /// Invariant violations detected by consistency checks
    Invariant(String),

    /// A job reached a terminal failure (retries exhausted or cancelled)
    TerminalFailure(String),

    /// Serialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::Cache(e) => write!(f, "Cache error: {}", e),
            Error::Graph(e) => write!(f, "Dependency graph error: {}", e),
            Error::Queue(e) => write!(f, "Queue error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::Invariant(msg) => write!(f, "Invariant violation: {}", msg),
            Error::TerminalFailure(msg) => write!(f, "Terminal failure: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => Some(e),
            Error::Cache(e) => Some(e),
            Error::Graph(e) => Some(e),
            Error::Queue(e) => Some(e),
            Error::Registry(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from component error types
impl From<crate::repository::StoreError> for Error {
    fn from(error: crate::repository::StoreError) -> Self {
        Error::Store(error)
    }
}

impl From<crate::cache::CacheError> for Error {
    fn from(error: crate::cache::CacheError) -> Self {
        Error::Cache(error)
    }
}

impl From<crate::graph::GraphError> for Error {
    fn from(error: crate::graph::GraphError) -> Self {
        Error::Graph(error)
    }
}

impl From<crate::queue::QueueError> for Error {
    fn from(error: crate::queue::QueueError) -> Self {
        Error::Queue(error)
    }
}

impl From<crate::registry::RegistryError> for Error {
    fn from(error: crate::registry::RegistryError) -> Self {
        Error::Registry(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new invariant violation error
    pub fn invariant<T: Into<String>>(msg: T) -> Self {
        Error::Invariant(msg.into())
    }

    /// Create a new terminal failure error
    pub fn terminal<T: Into<String>>(msg: T) -> Self {
        Error::TerminalFailure(msg.into())
    }
}

impl Error {
    /// Reason tag for the uniform `{ ok, reason }` handler contract.
    ///
    /// Maps every error onto the engine's outcome taxonomy so callers can
    /// switch on a stable tag instead of matching variants.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Store(_) => "store_unavailable",
            Error::Cache(_) => "cache",
            Error::Graph(e) => e.reason(),
            Error::Queue(_) => "queue_full",
            Error::Registry(e) => e.reason(),
            Error::Invariant(_) => "invariant",
            Error::TerminalFailure(_) => "terminal_failure",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }

    /// Whether the engine may retry the failed operation internally.
    /// Validation and terminal outcomes are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_transient())
    }
}
