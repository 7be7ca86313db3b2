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
    io::{Cursor, Write},
    sync::Arc
};

use axum::{
    body::Body,
    http::{
        header::{
            ACCEPT_RANGES, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE
        },
        Method, Request, StatusCode
    },
    Router
};
use repack_api::{ChannelId, ObjectRef, RepackOrchestrator, Result};
use repack_server::{create_router, AppState, MAX_RANGE_SPAN, REQUEST_ID_HEADER};
use repack_sign::{signature_file::b64_digest, Signer};
use repack_store::MemoryStore;
use tower::ServiceExt;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

const URI: &str = "/?src=apps/release/game.apk&cid=huawei";

struct DigestSigner;

impl Signer for DigestSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(b64_digest(data).into_bytes())
    }
}

struct Fixture {
    router: Router,
    store: Arc<MemoryStore>,
    expected: Vec<u8>,
    split_offset: u64,
    _work_dir: tempfile::TempDir
}

fn sample_apk() -> Vec<u8> {
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("classes.dex", stored).unwrap();
    let dex: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
    zip.write_all(&dex).unwrap();
    zip.start_file("META-INF/MANIFEST.MF", stored).unwrap();
    zip.write_all(b"Manifest-Version: 1.0\r\n\r\nName: classes.dex\r\nSHA1-Digest: AAAA\r\n\r\n")
        .unwrap();
    zip.finish().unwrap().into_inner()
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let source = ObjectRef::parse("apps/release/game.apk").unwrap();
    store.insert(&source, sample_apk());
    let work_dir = tempfile::tempdir().unwrap();

    // Reference output from a separate scratch directory
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = RepackOrchestrator::new(store.clone(), Arc::new(DigestSigner), reference_dir.path());
    let channel = ChannelId::parse("huawei").unwrap();
    let mut expected = vec![];
    reference.export_local(&source, &channel, &mut expected).unwrap();
    let split_offset = reference
        .compute_or_get_cached(&source, &channel)
        .unwrap()
        .result
        .split_offset;

    let orchestrator = RepackOrchestrator::new(store.clone(), Arc::new(DigestSigner), work_dir.path());
    Fixture {
        router: create_router(AppState::new(orchestrator)),
        store,
        expected,
        split_offset,
        _work_dir: work_dir
    }
}

fn request(method: Method, uri: &str, range: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(REQUEST_ID_HEADER, "req-1");
    if let Some(range) = range {
        builder = builder.header(RANGE, range);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn header<'a>(response: &'a axum::response::Response, name: impl axum::http::header::AsHeaderName) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

#[tokio::test]
async fn head_reports_the_repacked_size() {
    let f = fixture();
    let response = f.router.oneshot(request(Method::HEAD, URI, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, ACCEPT_RANGES), "bytes");
    assert_eq!(header(&response, CONTENT_LENGTH), f.expected.len().to_string());
}

#[tokio::test]
async fn whole_package_is_a_200() {
    let f = fixture();
    let total = f.expected.len();
    let range = format!("bytes=0-{}", total + 1000);
    let response = f
        .router
        .oneshot(request(Method::GET, URI, Some(&range)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, CONTENT_RANGE), format!("bytes 0-{}/{total}", total - 1));
    assert_eq!(header(&response, CONTENT_LENGTH), total.to_string());
    assert_eq!(header(&response, CACHE_CONTROL), "max-age=604800");
    assert_eq!(
        header(&response, CONTENT_DISPOSITION),
        "attachment; filename=\"game_huawei.apk\""
    );
    assert_eq!(body_bytes(response).await, f.expected);
}

#[tokio::test]
async fn ranges_are_stitched_across_the_split() {
    let f = fixture();
    let total = f.expected.len() as u64;
    let split = f.split_offset;
    for (start, end) in [(0, 99), (split - 50, split + 49), (split, split + 9), (total - 10, total - 1), (5, 5)] {
        let range = format!("bytes={start}-{end}");
        let response = f
            .router
            .clone()
            .oneshot(request(Method::GET, URI, Some(&range)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT, "{range}");
        assert_eq!(header(&response, CONTENT_RANGE), format!("bytes {start}-{end}/{total}"));
        assert_eq!(
            body_bytes(response).await,
            f.expected[start as usize..=end as usize],
            "{range}"
        );
    }
}

#[tokio::test]
async fn invalid_requests_never_reach_the_store() {
    let f = fixture();
    let calls = f.store.calls().total();
    let too_long = format!("bytes=0-{MAX_RANGE_SPAN}");
    let cases = [
        (Method::GET, URI, None),
        (Method::GET, URI, Some("bytes=10-")),
        (Method::GET, URI, Some(too_long.as_str())),
        (Method::GET, "/?src=nobucket&cid=huawei", Some("bytes=0-1")),
        (Method::GET, "/?src=apps/game.apk&cid=line%0Abreak", Some("bytes=0-1")),
        (Method::GET, "/?src=apps/game.apk&cid=", Some("bytes=0-1")),
        (Method::HEAD, "/?cid=huawei", None),
        (Method::POST, URI, Some("bytes=0-1"))
    ];
    for (method, uri, range) in cases {
        let response = f
            .router
            .clone()
            .oneshot(request(method.clone(), uri, range))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{method} {uri} {range:?}");
        // HEAD responses carry no body
        if method != Method::HEAD {
            assert!(body_bytes(response).await.starts_with(b"error: "));
        }
    }
    assert_eq!(f.store.calls().total(), calls);
}

#[tokio::test]
async fn start_past_the_end_is_rejected() {
    let f = fixture();
    let total = f.expected.len();
    let range = format!("bytes={total}-{}", total + 10);
    let response = f
        .router
        .oneshot(request(Method::GET, URI, Some(&range)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.starts_with("error: invalid range"), "{body}");
}

#[tokio::test]
async fn missing_objects_are_reported() {
    let f = fixture();
    let response = f
        .router
        .oneshot(request(Method::GET, "/?src=apps/other.apk&cid=huawei", Some("bytes=0-9")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("apps/other.apk"), "{body}");
}

#[tokio::test]
async fn non_ascii_channels_are_served() {
    let f = fixture();
    let response = f
        .router
        .oneshot(request(
            Method::GET,
            "/?src=apps/release/game.apk&cid=%E5%8D%8E%E4%B8%BA",
            Some("bytes=0-99")
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header(&response, CONTENT_DISPOSITION),
        "attachment; filename=\"game___.apk\"; filename*=UTF-8''game_%E5%8D%8E%E4%B8%BA.apk"
    );
    assert_eq!(body_bytes(response).await, f.expected[..100]);
}
