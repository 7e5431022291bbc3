use thiserror::Error;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} status transition from '{from}' to '{to}'")]
    InvalidStatusTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DeliveryError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStatusTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
