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

//! # Repack API
//!
//! This crate exposes the main public API through which the server and the
//! CLI rewrite the channel of a package stored in a remote bucket.
//!
//! ## Computing the footer
//!
//! Only the end of the package changes. The orchestrator reads the remote
//! archive's central directory and manifest, re-signs it and produces a
//! footer. The repacked package is the source object's first
//! [RepackResult::split_offset] bytes followed by that footer.
//!
//! ```ignore
//! let orchestrator = RepackOrchestrator::new(store, signer, "/mnt/auto");
//! let repacked = orchestrator.compute_or_get_cached(&source, &channel)?;
//! println!("{} bytes", repacked.result.total_size());
//! ```
//!
//! Footers are cached on local disk per source and channel, so only the first
//! request for a pair touches more than a few kilobytes of the remote object.
//!
//! ## Writing the whole package
//!
//! [RepackOrchestrator::export_local] streams the package into any writer and
//! [RepackOrchestrator::materialize] commits it as a new remote object with
//! server-side part copies.

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc
};

use repack_sign::{JarResigner, Signer, CHANNEL_MARKER_PATH};
use repack_store::{
    MultipartConfig, MultipartRemoteWriter, ObjectStore, RangedRemoteReader, READ_AHEAD_WINDOW
};
use repack_zip::ArchiveSplicer;
use tracing::{debug, info, instrument};

mod scratch;

pub use repack_common::{ChannelId, ErrorKind, ObjectRef, RepackError, Result};
pub use scratch::{RepackResult, Repacked, ScratchPaths};

/// Computes, caches and writes out repacked packages.
pub struct RepackOrchestrator {
    store: Arc<dyn ObjectStore>,
    resigner: JarResigner,
    work_dir: PathBuf
}

impl RepackOrchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, signer: Arc<dyn Signer>, work_dir: impl Into<PathBuf>) -> Self {
        RepackOrchestrator {
            store,
            resigner: JarResigner::new(signer),
            work_dir: work_dir.into()
        }
    }

    pub fn scratch_paths(&self, source: &ObjectRef, channel: &ChannelId) -> ScratchPaths {
        ScratchPaths::new(&self.work_dir, source, channel)
    }

    /// Opens a reader over the untouched source object.
    pub fn open_source(&self, source: &ObjectRef) -> Result<RangedRemoteReader> {
        RangedRemoteReader::open(self.store.clone(), source.clone())
    }

    /// Returns the footer for `(source, channel)`, computing it on first use.
    ///
    /// A cached result is returned as is. A failed computation leaves no meta
    /// file behind, so the next call starts over.
    #[instrument(skip_all, fields(%source, %channel))]
    pub fn compute_or_get_cached(&self, source: &ObjectRef, channel: &ChannelId) -> Result<Repacked> {
        let paths = self.scratch_paths(source, channel);
        if let Some(cached) = paths.load()? {
            debug!(offset = cached.result.split_offset, "using cached footer");
            return Ok(cached);
        }

        std::fs::create_dir_all(&paths.dir)?;
        let mut splicer = ArchiveSplicer::open(self.open_source(source)?)?;
        let artifacts = self.resigner.resign(&mut splicer, channel)?;
        artifacts.persist(&paths.dir)?;

        let mut footer = vec![];
        let mut writer = splicer.append(&mut footer);
        writer.add_file(CHANNEL_MARKER_PATH, channel.as_bytes())?;
        for (path, data) in artifacts.entries() {
            writer.add_file(&path, data)?;
        }
        let footer_size = writer.finish()?;

        let result = RepackResult {
            split_offset: splicer.append_offset(),
            footer_size
        };
        paths.store(&result, &footer)?;
        info!(offset = result.split_offset, footer_size, "footer computed");

        paths.load()?.ok_or_else(|| {
            RepackError::FileIoError(
                io::Error::new(io::ErrorKind::NotFound, "footer disappeared after writing").into()
            )
        })
    }

    /// Writes the complete repacked package to `sink` and returns its size.
    #[instrument(skip_all, fields(%source, %channel))]
    pub fn export_local<W: Write>(&self, source: &ObjectRef, channel: &ChannelId, mut sink: W) -> Result<u64> {
        let Repacked { result, mut footer } = self.compute_or_get_cached(source, channel)?;
        let mut reader = self.open_source(source)?;

        let mut offset = 0;
        while offset < result.split_offset {
            let len = READ_AHEAD_WINDOW.min(result.split_offset - offset);
            sink.write_all(&reader.read_range(offset, len as usize)?)?;
            offset += len;
        }
        let copied = io::copy(&mut footer, &mut sink)?;
        sink.flush()?;
        Ok(result.split_offset + copied)
    }

    /// Commits the repacked package as the object `dest`. The source prefix
    /// never leaves the store.
    #[instrument(skip_all, fields(%source, %channel, %dest))]
    pub fn materialize(
        &self,
        source: &ObjectRef,
        channel: &ChannelId,
        dest: &ObjectRef,
        config: MultipartConfig
    ) -> Result<RepackResult> {
        let Repacked { result, mut footer } = self.compute_or_get_cached(source, channel)?;
        let mut writer = MultipartRemoteWriter::new(
            self.store.clone(),
            source.clone(),
            dest.clone(),
            result.split_offset,
            config
        );
        io::copy(&mut footer, &mut writer)?;
        writer.commit()?;
        info!(size = result.total_size(), "materialized");
        Ok(result)
    }
}
