use thiserror::Error;

use crate::model::DateSpan;

/// Failure taxonomy shared by the store, the availability engine and the workflows.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input. The caller can re-prompt.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Referenced item, reservation or restriction does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The range was taken between the availability check and the commit.
    #[error("item {item_id} is already booked for {span}")]
    Conflict { item_id: i64, span: DateSpan },

    /// Store unreachable, timed out, or rejected the write.
    #[error("{op} failed: {cause}")]
    Persistence { op: &'static str, cause: String },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn persistence(op: &'static str, cause: impl std::fmt::Display) -> Self {
        Error::Persistence {
            op,
            cause: cause.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Wording safe to show a customer. Persistence details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::NotFound { entity, .. } => format!("the requested {entity} could not be found"),
            Error::Conflict { .. } => {
                "someone just booked this laptop for those dates, please pick another range".into()
            }
            Error::Persistence { .. } => "something went wrong, please try again later".into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
