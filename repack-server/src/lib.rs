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

//! HTTP front end serving repacked packages as one addressable resource.
//!
//! `GET /?src=<bucket/key>&cid=<channel>` with a `Range: bytes=<start>-<end>`
//! header returns that slice of the repacked package, `HEAD` its size.

mod error;
mod handler;
pub mod range;

pub use error::ApiError;
pub use handler::{create_router, AppState, REQUEST_ID_HEADER};
pub use range::{ByteRange, ServePlan, MAX_RANGE_SPAN};

/// Serves the router on `listener` until the process is stopped.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, create_router(state)).await
}
