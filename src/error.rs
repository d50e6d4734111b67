use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

/// Fatal at engine construction; the engine refuses to start.
#[derive(Debug, Display, Error)]
pub enum RegistryError {
    #[display("duplicate calculator name \"{name}\"")]
    DuplicateName { name: String },
    #[display("calculator with empty name registered in {family}")]
    EmptyName { family: String },
    #[display("invalid metadata for \"{name}\": {reason}")]
    InvalidMetadata { name: String, reason: String },
    #[display("calculator settings reference unknown calculator \"{name}\"")]
    UnknownOverride { name: String },
}

#[derive(Debug, Display, Error)]
pub enum DataError {
    #[display("no data available for stock {stock_id}")]
    Unavailable { stock_id: String },
    #[display("malformed series for stock {stock_id}: {reason}")]
    Malformed { stock_id: String, reason: String },
    #[display("failed to query series")]
    Query,
}

#[derive(Debug, Display, Error)]
pub enum CalculationError {
    #[display("invalid input: {reason}")]
    InvalidInput { reason: String },
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
    #[display("metric undefined: {reason}")]
    Undefined { reason: String },
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
    #[display("failed to decode stored {what}")]
    Decode { what: String },
}

#[derive(Debug, Display, Error)]
pub enum EngineError {
    #[display("failed to resolve stock universe")]
    Universe,
    #[display("failed to resolve trading dates")]
    Calendar,
    #[display("invalid plan: {reason}")]
    InvalidPlan { reason: String },
}

#[derive(Debug, Display, Error)]
pub enum SchedulerError {
    #[display("failed to initialise scheduler")]
    Init,
    #[display("invalid cron expression \"{cron}\"")]
    InvalidCron { cron: String },
    #[display("failed to start scheduler")]
    Start,
}

#[derive(Debug, Display, Error)]
pub enum ImportError {
    #[display("failed to read {path}")]
    Read { path: String },
    #[display("invalid row in {path}: {reason}")]
    Parse { path: String, reason: String },
    #[display("failed to store imported rows")]
    Store,
}
