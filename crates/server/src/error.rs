use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use insureflow_core::{ApplicationError, FieldError, InterfaceError};
use serde::Serialize;
use tracing::{error, warn};

/// Transport wrapper that renders an [`InterfaceError`] as a JSON body.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    pub detail: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_confirmation: bool,
}

impl ApiError {
    pub fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }

    pub fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_owned(),
        })
    }

    pub fn unauthorized(correlation_id: &str) -> Self {
        Self(InterfaceError::Unauthorized {
            message: "missing or unknown X-API-KEY".to_owned(),
            correlation_id: correlation_id.to_owned(),
        })
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let interface = self.0;
        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %interface.correlation_id(),
                error_code = interface.error_code(),
                error = %interface,
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request.rejected",
                correlation_id = %interface.correlation_id(),
                error_code = interface.error_code(),
                error = %interface,
                "request rejected"
            );
        }

        let (field_errors, requires_confirmation) = match &interface {
            InterfaceError::Unprocessable { field_errors, .. } => (field_errors.clone(), false),
            InterfaceError::BadGateway { requires_confirmation, .. } => {
                (Vec::new(), *requires_confirmation)
            }
            _ => (Vec::new(), false),
        };
        let body = ErrorBody {
            error: interface.error_code(),
            message: interface.user_message(),
            detail: interface.to_string(),
            correlation_id: interface.correlation_id().to_owned(),
            field_errors,
            requires_confirmation,
        };
        (status, Json(body)).into_response()
    }
}
