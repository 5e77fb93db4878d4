// Copyright 2025 The Tenama Authors.
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

//! Error kinds surfaced at the API boundary.

use http::StatusCode;
use thiserror::Error;

use crate::accounting::AdmissionRejection;
use crate::cluster::ClusterError;

/// Errors returned by the lifecycle operations, each mapping to an HTTP
/// status on the REST surface.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request was malformed: missing infix, unparseable duration or
    /// quantity, or a name that canonicalizes to nothing.
    #[error("{0}")]
    BadInput(String),

    /// Basic-auth credentials were missing or did not match.
    #[error("authentication required")]
    Unauthenticated,

    /// A namespace with the requested canonical name already exists.
    #[error("namespace {0} already exists")]
    Conflict(String),

    /// The reservation would push the aggregate over the global limits.
    #[error(transparent)]
    AdmissionDenied(#[from] AdmissionRejection),

    /// The namespace is outside the managed prefix or the cluster reported
    /// it missing.
    #[error("namespace {0} not found")]
    NotFound(String),

    /// The cluster API returned an error.
    #[error("cluster request failed: {0}")]
    Upstream(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApiError {
    /// The HTTP status code this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::AdmissionDenied(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::AlreadyExists(name) => ApiError::Conflict(name),
            ClusterError::NotFound(name) => ApiError::NotFound(name),
            ClusterError::Upstream(source) => ApiError::Upstream(source),
        }
    }
}
