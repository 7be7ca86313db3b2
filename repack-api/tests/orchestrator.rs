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
    io::{Cursor, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc
    }
};

use repack_api::*;
use repack_sign::{signature_file::b64_digest, Signer};
use repack_store::{MemoryStore, MultipartConfig, ObjectStore};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST: &[u8] = b"Manifest-Version: 1.0\r\nCreated-By: 1.0 (Android)\r\n\r\n\
Name: classes.dex\r\nSHA1-Digest: Jr5eg4nyoXRqhpJ5S4mfA46kjnk=\r\n\r\n\
Name: assets/dap.properties\r\nSHA1-Digest: 2jmj7l5rSw0yVb/vlWAYkK/YBwk=\r\n\r\n";

/// Signs by digesting, and fails on demand.
#[derive(Default)]
struct TestSigner {
    fail: AtomicBool
}

impl Signer for TestSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RepackError::SignerCommandFailed("exit status: 1".into()));
        }
        Ok(format!("signed:{}", b64_digest(data)).into_bytes())
    }
}

fn sample_apk(dex_size: usize) -> Vec<u8> {
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("AndroidManifest.xml", stored).unwrap();
    zip.write_all(b"<manifest/>").unwrap();
    zip.start_file("classes.dex", stored).unwrap();
    let dex: Vec<u8> = (0..dex_size).map(|i| (i % 251) as u8).collect();
    zip.write_all(&dex).unwrap();
    zip.start_file("assets/dap.properties", stored).unwrap();
    zip.start_file("META-INF/MANIFEST.MF", stored).unwrap();
    zip.write_all(MANIFEST).unwrap();
    zip.start_file("META-INF/ANDROIDD.SF", stored).unwrap();
    zip.write_all(b"stale").unwrap();
    zip.start_file("META-INF/ANDROIDD.RSA", stored).unwrap();
    zip.write_all(b"stale").unwrap();
    zip.finish().unwrap().into_inner()
}

struct Fixture {
    store: Arc<MemoryStore>,
    signer: Arc<TestSigner>,
    work_dir: tempfile::TempDir,
    source: ObjectRef,
    channel: ChannelId,
    original: Vec<u8>
}

impl Fixture {
    fn new(dex_size: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let source = ObjectRef::parse("apps/release/game.apk").unwrap();
        let original = sample_apk(dex_size);
        store.insert(&source, original.clone());
        Fixture {
            store,
            signer: Arc::new(TestSigner::default()),
            work_dir: tempfile::tempdir().unwrap(),
            source,
            channel: ChannelId::parse("xiaomi").unwrap(),
            original
        }
    }

    fn orchestrator(&self) -> RepackOrchestrator {
        RepackOrchestrator::new(self.store.clone(), self.signer.clone(), self.work_dir.path())
    }
}

fn footer_bytes(mut footer: std::fs::File) -> Vec<u8> {
    let mut bytes = vec![];
    footer.read_to_end(&mut bytes).unwrap();
    bytes
}

fn read_entry(package: &[u8], name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(Cursor::new(package)).unwrap();
    let mut data = vec![];
    archive.by_name(name).unwrap().read_to_end(&mut data).unwrap();
    data
}

#[test]
fn computes_a_footer_that_completes_the_prefix() {
    let fixture = Fixture::new(4096);
    let orchestrator = fixture.orchestrator();
    let Repacked { result, mut footer } = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap();

    let mut package = fixture.original[..result.split_offset as usize].to_vec();
    footer.read_to_end(&mut package).unwrap();
    assert_eq!(package.len() as u64, result.total_size());

    assert_eq!(read_entry(&package, "assets/dap.properties"), b"xiaomi");
    assert_eq!(read_entry(&package, "classes.dex").len(), 4096);
    let manifest = read_entry(&package, "META-INF/MANIFEST.MF");
    let record = format!(
        "Name: assets/dap.properties\r\nSHA1-Digest: {}\r\n\r\n",
        b64_digest("xiaomi")
    );
    assert!(manifest.ends_with(record.as_bytes()));
    assert_eq!(manifest.windows(b"dap.properties".len()).filter(|w| w == b"dap.properties").count(), 1);

    let sf = read_entry(&package, "META-INF/ANDROIDD.SF");
    assert!(sf.starts_with(b"Signature-Version: 1.0\r\n"));
    assert_eq!(
        read_entry(&package, "META-INF/ANDROIDD.RSA"),
        format!("signed:{}", b64_digest(&sf)).into_bytes()
    );

    let paths = orchestrator.scratch_paths(&fixture.source, &fixture.channel);
    for artifact in ["MANIFEST.MF", "ANDROIDD.SF", "ANDROIDD.RSA", "game.apk.footer", "game.apk.meta"] {
        assert!(paths.dir.join(artifact).is_file(), "{artifact}");
    }
}

#[test]
fn cached_results_are_returned_without_store_calls() {
    let fixture = Fixture::new(4096);
    let orchestrator = fixture.orchestrator();
    let first = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap();
    let first_footer = footer_bytes(first.footer);
    let calls = fixture.store.calls().total();

    let second = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap();
    assert_eq!(first.result, second.result);
    assert_eq!(footer_bytes(second.footer), first_footer);
    assert_eq!(fixture.store.calls().total(), calls);

    // A new orchestrator over the same scratch directory sees the cache too
    let third = fixture
        .orchestrator()
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap();
    assert_eq!(third.result, first.result);
    assert_eq!(footer_bytes(third.footer), first_footer);
    assert_eq!(fixture.store.calls().total(), calls);
}

#[test]
fn wiped_scratch_is_recomputed_identically() {
    let fixture = Fixture::new(4096);
    let orchestrator = fixture.orchestrator();
    let first = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap();
    let first_footer = footer_bytes(first.footer);
    let calls = fixture.store.calls().total();

    let paths = orchestrator.scratch_paths(&fixture.source, &fixture.channel);
    std::fs::remove_dir_all(&paths.dir).unwrap();

    let again = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap();
    assert!(fixture.store.calls().total() > calls);
    assert_eq!(again.result, first.result);
    assert_eq!(footer_bytes(again.footer), first_footer);
    assert!(paths.meta.is_file());
}

#[test]
fn sources_with_the_same_flattened_name_do_not_share_a_cache() {
    let fixture = Fixture::new(1024);
    let nested = ObjectRef::parse("apps/x/y/game.apk").unwrap();
    let joined = ObjectRef::parse("apps/x_y/game.apk").unwrap();
    fixture.store.insert(&nested, sample_apk(1024));
    fixture.store.insert(&joined, sample_apk(3000));
    let channel = ChannelId::parse("huawei").unwrap();

    let orchestrator = fixture.orchestrator();
    assert_ne!(
        orchestrator.scratch_paths(&nested, &channel).footer,
        orchestrator.scratch_paths(&joined, &channel).footer
    );

    let mut a = vec![];
    let mut b = vec![];
    orchestrator.export_local(&nested, &channel, &mut a).unwrap();
    orchestrator.export_local(&joined, &channel, &mut b).unwrap();
    assert_eq!(read_entry(&a, "classes.dex").len(), 1024);
    assert_eq!(read_entry(&b, "classes.dex").len(), 3000);
    assert_eq!(read_entry(&a, "assets/dap.properties"), b"huawei");
    assert_eq!(read_entry(&b, "assets/dap.properties"), b"huawei");
}

#[test]
fn non_ascii_channels_are_written_verbatim() {
    let fixture = Fixture::new(1024);
    let orchestrator = fixture.orchestrator();
    for raw in ["华为", "app store", "../up"] {
        let channel = ChannelId::parse(raw).unwrap();
        let mut package = vec![];
        orchestrator.export_local(&fixture.source, &channel, &mut package).unwrap();
        assert_eq!(read_entry(&package, "assets/dap.properties"), raw.as_bytes());
        let paths = orchestrator.scratch_paths(&fixture.source, &channel);
        assert_eq!(paths.dir.parent(), Some(fixture.work_dir.path()));
    }
}

#[test]
fn channels_are_cached_separately() {
    let fixture = Fixture::new(1024);
    let orchestrator = fixture.orchestrator();
    let oppo = ChannelId::parse("oppo").unwrap();
    let mut a = vec![];
    let mut b = vec![];
    orchestrator.export_local(&fixture.source, &fixture.channel, &mut a).unwrap();
    orchestrator.export_local(&fixture.source, &oppo, &mut b).unwrap();
    assert_eq!(read_entry(&a, "assets/dap.properties"), b"xiaomi");
    assert_eq!(read_entry(&b, "assets/dap.properties"), b"oppo");
}

#[test]
fn failed_signing_caches_nothing() {
    let fixture = Fixture::new(1024);
    let orchestrator = fixture.orchestrator();
    fixture.signer.fail.store(true, Ordering::SeqCst);

    let err = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Signing);
    let paths = orchestrator.scratch_paths(&fixture.source, &fixture.channel);
    assert!(!paths.meta.exists());
    assert!(!paths.footer.exists());

    fixture.signer.fail.store(false, Ordering::SeqCst);
    let repacked = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap();
    assert!(repacked.result.footer_size > 0);
    assert!(paths.meta.is_file());
}

#[test]
fn missing_source_is_a_store_error() {
    let fixture = Fixture::new(16);
    let missing = ObjectRef::parse("apps/absent.apk").unwrap();
    let err = fixture
        .orchestrator()
        .compute_or_get_cached(&missing, &fixture.channel)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);
}

#[test]
fn export_local_matches_the_cached_result() {
    let fixture = Fixture::new(5 * 1024 * 1024);
    let orchestrator = fixture.orchestrator();
    let mut package = vec![];
    let written = orchestrator
        .export_local(&fixture.source, &fixture.channel, &mut package)
        .unwrap();
    assert_eq!(written, package.len() as u64);

    let result = orchestrator
        .compute_or_get_cached(&fixture.source, &fixture.channel)
        .unwrap()
        .result;
    assert_eq!(written, result.total_size());
    assert_eq!(
        package[..result.split_offset as usize],
        fixture.original[..result.split_offset as usize]
    );
    assert_eq!(read_entry(&package, "classes.dex").len(), 5 * 1024 * 1024);
}

#[test]
fn materialize_with_a_single_put() {
    let fixture = Fixture::new(2048);
    let orchestrator = fixture.orchestrator();
    let dest = ObjectRef::parse("apps/channels/game_xiaomi.apk").unwrap();
    orchestrator
        .materialize(&fixture.source, &fixture.channel, &dest, MultipartConfig::default())
        .unwrap();

    let mut expected = vec![];
    orchestrator
        .export_local(&fixture.source, &fixture.channel, &mut expected)
        .unwrap();
    assert_eq!(fixture.store.object(&dest).unwrap(), expected);
    assert_eq!(fixture.store.calls().put, 1);
    assert_eq!(fixture.store.calls().multipart(), 0);
}

#[test]
fn materialize_with_part_copies() {
    let fixture = Fixture::new(64 * 1024);
    let orchestrator = fixture.orchestrator();
    let dest = ObjectRef::parse("apps/channels/game_xiaomi.apk").unwrap();
    let config = MultipartConfig {
        part_size: 16 * 1024,
        min_part_size: 1024,
        workers: 3
    };
    let result = orchestrator
        .materialize(&fixture.source, &fixture.channel, &dest, config)
        .unwrap();

    let mut expected = vec![];
    orchestrator
        .export_local(&fixture.source, &fixture.channel, &mut expected)
        .unwrap();
    let materialized = fixture.store.object(&dest).unwrap();
    assert_eq!(materialized.len() as u64, result.total_size());
    assert_eq!(materialized, expected);

    let calls = fixture.store.calls();
    assert_eq!(calls.put, 0);
    assert_eq!(calls.create_multipart_upload, 1);
    assert_eq!(calls.complete_multipart_upload, 1);
    assert_eq!(calls.upload_part, 1);
    assert!(calls.upload_part_copy >= 4);
    assert_eq!(fixture.store.head(&dest).unwrap().size, result.total_size());
}
