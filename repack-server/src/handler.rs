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

use std::{
    io::{Read, Seek, SeekFrom},
    sync::Arc
};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{
        header::{
            ACCEPT_RANGES, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
            CONTENT_TYPE, RANGE
        },
        HeaderMap, Method, StatusCode
    },
    response::{IntoResponse, Response},
    routing::any,
    Router
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use repack_api::{ChannelId, ObjectRef, RepackOrchestrator, Repacked, Result};
use serde::Deserialize;
use tracing::{debug, field, instrument, Span};

use crate::{
    error::ApiError,
    range::{ByteRange, ServePlan}
};

pub const REQUEST_ID_HEADER: &str = "x-fc-request-id";
const CACHE_MAX_AGE: &str = "max-age=604800";

/// Characters left unescaped in an RFC 8187 `filename*` value.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// An attachment header for `filename`. Names that are not plain printable
/// ASCII get an ASCII fallback plus a UTF-8 `filename*` parameter.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_'
        })
        .collect();
    if fallback == filename {
        format!("attachment; filename=\"{filename}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            utf8_percent_encode(filename, ATTR_CHAR)
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RepackOrchestrator>
}

impl AppState {
    pub fn new(orchestrator: RepackOrchestrator) -> Self {
        AppState {
            orchestrator: Arc::new(orchestrator)
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new().route("/", any(serve_package)).with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct PackageQuery {
    #[serde(default)]
    src: String,
    #[serde(default)]
    cid: String
}

/// A validated request, built before anything touches the store.
struct PackageRequest {
    source: ObjectRef,
    channel: ChannelId,
    range: Option<ByteRange>
}

enum Served {
    Head { total: u64 },
    Range { plan: ServePlan, body: Vec<u8> }
}

#[instrument(skip_all, fields(%method, request_id = field::Empty))]
async fn serve_package(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<PackageQuery>,
    headers: HeaderMap
) -> std::result::Result<Response, ApiError> {
    if let Some(id) = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Span::current().record("request_id", id);
    }

    let range = match method {
        Method::HEAD => None,
        Method::GET => Some(ByteRange::parse(headers.get(RANGE).and_then(|v| v.to_str().ok()))?),
        other => return Err(ApiError::UnsupportedMethod(other))
    };
    let request = PackageRequest {
        source: ObjectRef::parse(&query.src)?,
        channel: ChannelId::parse(&query.cid)?,
        range
    };
    let filename = request.source.download_name(&request.channel);

    let span = Span::current();
    let orchestrator = state.orchestrator.clone();
    let served = tokio::task::spawn_blocking(move || {
        span.in_scope(|| resolve_and_read(&orchestrator, &request))
    })
    .await??;

    let response = match served {
        Served::Head { total } => (
            StatusCode::OK,
            [(ACCEPT_RANGES, "bytes".to_string()), (CONTENT_LENGTH, total.to_string())]
        )
            .into_response(),
        Served::Range { plan, body } => {
            let status = if plan.is_complete() {
                StatusCode::OK
            } else {
                StatusCode::PARTIAL_CONTENT
            };
            (
                status,
                [
                    (ACCEPT_RANGES, "bytes".to_string()),
                    (CACHE_CONTROL, CACHE_MAX_AGE.to_string()),
                    (CONTENT_DISPOSITION, content_disposition(&filename)),
                    (CONTENT_TYPE, "application/octet-stream".to_string()),
                    (CONTENT_RANGE, plan.content_range()),
                    (CONTENT_LENGTH, plan.len().to_string())
                ],
                Body::from(body)
            )
                .into_response()
        }
    };
    Ok(response)
}

/// Runs on the blocking pool: computes or loads the footer, then stitches
/// the requested bytes from the remote prefix and the footer file.
fn resolve_and_read(orchestrator: &RepackOrchestrator, request: &PackageRequest) -> Result<Served> {
    let Repacked { result, mut footer } =
        orchestrator.compute_or_get_cached(&request.source, &request.channel)?;
    let Some(range) = request.range else {
        return Ok(Served::Head {
            total: result.total_size()
        });
    };

    let plan = ServePlan::new(range, &result)?;
    debug!(start = plan.start, end = plan.end, remote = ?plan.remote, footer = ?plan.footer, "serving");
    let mut body = Vec::with_capacity(plan.len() as usize);
    if let Some((start, end)) = plan.remote {
        let mut reader = orchestrator.open_source(&request.source)?;
        body.extend(reader.read_range(start, (end - start) as usize)?);
    }
    if let Some((start, end)) = plan.footer {
        footer.seek(SeekFrom::Start(start))?;
        let mut part = vec![0; (end - start) as usize];
        footer.read_exact(&mut part)?;
        body.extend(part);
    }
    Ok(Served::Range { plan, body })
}
