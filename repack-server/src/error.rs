// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::{
    http::{Method, StatusCode},
    response::{IntoResponse, Response}
};
use repack_api::RepackError;
use tokio::task::JoinError;
use tracing::warn;

/// Everything a request can fail with. Rendered as plain text
/// `error: <message>`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Repack(#[from] RepackError),
    #[error("method {0} is not supported")]
    UnsupportedMethod(Method),
    /// The blocking task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(#[from] JoinError)
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Repack(_) | ApiError::UnsupportedMethod(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(%status, error = %self, "request failed");
        (status, format!("error: {self}")).into_response()
    }
}
