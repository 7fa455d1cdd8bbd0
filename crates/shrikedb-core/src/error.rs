use thiserror::Error;

/// Errors raised by the storage and query layers.
///
/// Every variant is fatal to the operation that raised it: a failed query
/// yields no partial result, and a failed insert never leaves a
/// half-appended row behind.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unsupported field type: {0}")]
    UnsupportedFieldType(String),
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("unsupported for group by: {0}")]
    UnsupportedForGroupBy(String),
    #[error("unsupported query shape: {0}")]
    UnsupportedQueryShape(String),
    #[error("unknown aggregate function: {0}")]
    UnknownAggregateFunction(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown order field: {0}")]
    UnknownOrderField(String),
    #[error("unsupported order value type: {0}")]
    UnsupportedOrderValueType(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("division by zero: {0}")]
    DivisionByZero(String),
}
