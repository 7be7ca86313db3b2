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
    collections::HashSet,
    io::{Cursor, Read, Seek, Write}
};

use deku::{DekuContainerRead, DekuContainerWrite};
use repack_common::*;
use tracing::debug;
use zip::{
    result::ZipError, write::SimpleFileOptions, CompressionMethod, DateTime, ZipArchive, ZipWriter
};

use crate::layout::{parse_central_directory, ArchiveLayout, EndOfCentralDirectory, EOCD_FIXED_SIZE};

/// Appends entries to an existing archive without touching its contents.
///
/// The output of [AppendWriter] is only the footer: new local entries, the
/// central directory and EOCD. The complete archive is the original bytes up
/// to [ArchiveSplicer::append_offset] followed by that footer.
pub struct ArchiveSplicer<R: Read + Seek> {
    layout: ArchiveLayout,
    archive: ZipArchive<R>
}

impl<R: Read + Seek> ArchiveSplicer<R> {
    pub fn open(mut reader: R) -> Result<Self> {
        let layout = ArchiveLayout::read(&mut reader)?;
        debug!(
            entries = layout.records.len(),
            cd_offset = layout.eocd.cd_offset,
            signing_block = ?layout.signing_block_offset,
            "parsed archive layout"
        );
        let archive = ZipArchive::new(reader)?;
        Ok(ArchiveSplicer { layout, archive })
    }

    /// Number of untouched bytes at the start of the archive. A v2/v3 APK
    /// Signing Block is not part of them, it would no longer match.
    pub fn append_offset(&self) -> u64 {
        self.layout.append_offset()
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Entry names in central directory order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.layout.records.iter().map(|r| r.name.as_str())
    }

    /// Reads and decompresses an entry, `None` if the archive has no such
    /// entry.
    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut file = match self.archive.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into())
        };
        let mut data = vec![];
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    pub fn append<W: Write>(&self, sink: W) -> AppendWriter<'_, W> {
        AppendWriter {
            sink,
            layout: &self.layout,
            entries: ZipWriter::new(Cursor::new(vec![])),
            added: HashSet::new()
        }
    }
}

/// Collects new entries and writes the footer on [AppendWriter::finish].
pub struct AppendWriter<'a, W: Write> {
    sink: W,
    layout: &'a ArchiveLayout,
    entries: ZipWriter<Cursor<Vec<u8>>>,
    added: HashSet<String>
}

impl<W: Write> AppendWriter<'_, W> {
    /// Adds a deflated entry. An existing entry of the same name is replaced.
    pub fn add_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        // Fixed timestamp keeps the footer reproducible
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());
        self.entries.start_file(path, options)?;
        self.entries.write_all(data)?;
        self.added.insert(path.to_string());
        Ok(())
    }

    /// Writes the footer to the sink and returns its size.
    pub fn finish(mut self) -> Result<u64> {
        let base = self.layout.append_offset();
        let staged = self.entries.finish()?.into_inner();

        // The staged archive is ours: no comment, so its EOCD is the last record
        let eocd_at = staged.len().checked_sub(EOCD_FIXED_SIZE).ok_or_else(|| {
            RepackError::ArchiveParsingFailed("staged entries have no EOCD".into())
        })?;
        let (_rest, staged_eocd) = EndOfCentralDirectory::from_bytes((&staged[eocd_at..], 0))?;
        let local_len = staged_eocd.cd_offset as usize;
        let new_records = parse_central_directory(&staged[local_len..eocd_at])?;

        let mut directory = vec![];
        let kept: Vec<_> = self
            .layout
            .records
            .iter()
            .filter(|r| !self.added.contains(&r.name))
            .collect();
        for record in &kept {
            directory.extend_from_slice(&record.raw);
        }
        for record in &new_records {
            directory.extend(record.relocated(base)?);
        }

        let total_entries = u16::try_from(kept.len() + new_records.len())
            .ok()
            .filter(|n| *n != u16::MAX)
            .ok_or_else(|| RepackError::Zip64Unsupported("too many entries".into()))?;
        let cd_offset = u32::try_from(base + local_len as u64)
            .ok()
            .filter(|o| *o != u32::MAX)
            .ok_or_else(|| RepackError::Zip64Unsupported("central directory offset".into()))?;
        let cd_size = u32::try_from(directory.len())
            .map_err(|_| RepackError::Zip64Unsupported("central directory size".into()))?;

        let original = &self.layout.eocd;
        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            cd_start_disk: 0,
            disk_entries: total_entries,
            total_entries,
            cd_size,
            cd_offset,
            comment_len: original.comment_len,
            comment: original.comment.clone()
        }
        .to_bytes()?;

        self.sink.write_all(&staged[..local_len])?;
        self.sink.write_all(&directory)?;
        self.sink.write_all(&eocd)?;
        self.sink.flush()?;

        let written = (local_len + directory.len() + eocd.len()) as u64;
        debug!(
            appended = new_records.len(),
            replaced = self.layout.records.len() - kept.len(),
            written,
            "wrote archive footer"
        );
        Ok(written)
    }
}
