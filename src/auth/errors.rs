use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use super::repo::{StoreError, UniqueField};
use super::schema::FieldError;

/// Identity fields that are safe to hand back to a caller whose credentials
/// were correct but whose account is still gated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validation failed")]
    ValidationFailed(Vec<FieldError>),
    #[error("account already exists ({0})")]
    AccountAlreadyExists(UniqueField),
    #[error("login failed")]
    LoginFailed,
    #[error("email address is not verified")]
    EmailNotVerified(UserIdentity),
    #[error("session is invalid")]
    InvalidSession,
    #[error("user referenced by the session does not exist")]
    UserDoesNotExist,
    #[error("verification token is invalid or expired")]
    InvalidVerificationToken,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateKey(UniqueField::Id) => {
                Self::Internal(anyhow::anyhow!("generated user id collided"))
            }
            StoreError::DuplicateKey(field) => Self::AccountAlreadyExists(field),
            StoreError::Missing => Self::UserDoesNotExist,
            StoreError::Other(e) => Self::Internal(e),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: &'static str,
    errors: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserIdentity>,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::AccountAlreadyExists(_) => "ACCOUNT_ALREADY_EXISTS",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::EmailNotVerified(_) => "EMAIL_NOT_VERIFIED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::UserDoesNotExist => "USER_DOES_NOT_EXIST",
            Self::InvalidVerificationToken => "INVALID_VERIFICATION_TOKEN",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ValidationFailed(_) | Self::InvalidVerificationToken => StatusCode::BAD_REQUEST,
            Self::AccountAlreadyExists(_) => StatusCode::CONFLICT,
            Self::LoginFailed | Self::InvalidSession | Self::UserDoesNotExist => {
                StatusCode::UNAUTHORIZED
            }
            Self::EmailNotVerified(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(self) -> ErrorBody {
        let code = self.code();
        let (message, errors, user) = match self {
            Self::ValidationFailed(errors) => ("Validation failed.", errors, None),
            Self::AccountAlreadyExists(field) => (
                "Account already exists.",
                vec![FieldError::new(field.as_str(), "is already taken")],
                None,
            ),
            Self::LoginFailed => (
                "Login failed.",
                vec![FieldError::new("login", "Username and password do not match.")],
                None,
            ),
            Self::EmailNotVerified(identity) => (
                "Email address is not verified.",
                vec![FieldError::new("email", "Email address is not verified.")],
                Some(identity),
            ),
            Self::InvalidSession => (
                "Session is invalid.",
                vec![FieldError::new("session", "Session is invalid.")],
                None,
            ),
            Self::UserDoesNotExist => (
                "The user for this session does not exist.",
                vec![FieldError::new("session", "Session user does not exist.")],
                None,
            ),
            Self::InvalidVerificationToken => (
                "Verification token is invalid or expired.",
                vec![FieldError::new("token", "is invalid or expired")],
                None,
            ),
            Self::Internal(_) => ("Internal server error.", Vec::new(), None),
        };
        ErrorBody {
            code,
            message,
            errors,
            user,
        }
    }
}

impl IntoResponse for AuthError {
    /// Internal details are logged here and never returned to the client.
    fn into_response(self) -> Response {
        if let Self::Internal(e) = &self {
            error!(error = %e, "internal error");
        }
        let status = self.status();
        (status, Json(self.body())).into_response()
    }
}
