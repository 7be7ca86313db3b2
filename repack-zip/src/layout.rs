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

// Records of the ZIP container named after APPNOTE.TXT
use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use deku::prelude::*;
use repack_common::*;

pub const EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";
pub const EOCD_FIXED_SIZE: usize = 22;
pub const ZIP64_LOCATOR_MAGIC: &[u8; 4] = b"PK\x06\x07";
pub const ZIP64_LOCATOR_SIZE: usize = 20;
pub const CD_RECORD_MAGIC: u32 = 0x0201_4b50;
pub const CD_RECORD_FIXED_SIZE: usize = 46;
pub const APK_SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";
// size_of_self_counted + magic, directly before the central directory
const APK_SIGNING_BLOCK_FOOTER_SIZE: u64 = 24;

// Offset of the local header offset field in a central directory record
const CD_LOCAL_OFFSET_FIELD: usize = 42;

#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"PK\x05\x06")]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_start_disk: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
    #[deku(count = "comment_len")]
    pub comment: Vec<u8>
}

impl EndOfCentralDirectory {
    /// Any of these fields saturated means the real value lives in a ZIP64
    /// record.
    fn needs_zip64(&self) -> bool {
        self.disk_entries == u16::MAX
            || self.total_entries == u16::MAX
            || self.cd_size == u32::MAX
            || self.cd_offset == u32::MAX
    }
}

/// One central directory record, kept byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralRecord {
    pub name: String,
    pub local_header_offset: u32,
    pub raw: Vec<u8>
}

impl CentralRecord {
    /// Moves the record's local header by `delta` bytes.
    pub fn relocated(&self, delta: u64) -> Result<Vec<u8>> {
        let offset = u64::from(self.local_header_offset) + delta;
        let offset = u32::try_from(offset)
            .ok()
            .filter(|o| *o != u32::MAX)
            .ok_or_else(|| {
                RepackError::Zip64Unsupported(format!("local header of {} at {offset}", self.name))
            })?;
        let mut raw = self.raw.clone();
        raw[CD_LOCAL_OFFSET_FIELD..CD_LOCAL_OFFSET_FIELD + 4].copy_from_slice(&offset.to_le_bytes());
        Ok(raw)
    }
}

/// Where things are in an existing archive.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    pub eocd: EndOfCentralDirectory,
    pub eocd_offset: u64,
    pub records: Vec<CentralRecord>,
    /// Start of an APK Signing Block sitting right before the central
    /// directory, if there is one.
    pub signing_block_offset: Option<u64>
}

impl ArchiveLayout {
    /// Reads the EOCD, the APK Signing Block footer and the central directory
    /// of the archive behind `reader`.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<ArchiveLayout> {
        let len = reader.seek(SeekFrom::End(0))?;
        let (eocd_offset, eocd) = find_eocd(reader, len)?;
        if eocd.needs_zip64() {
            return Err(RepackError::Zip64Unsupported(
                "end of central directory fields are saturated".into()
            ));
        }
        if eocd_offset >= ZIP64_LOCATOR_SIZE as u64 {
            let locator = read_exact_at(reader, eocd_offset - ZIP64_LOCATOR_SIZE as u64, 4)?;
            if locator == ZIP64_LOCATOR_MAGIC {
                return Err(RepackError::Zip64Unsupported("zip64 locator present".into()));
            }
        }

        let cd_offset = u64::from(eocd.cd_offset);
        let cd_size = u64::from(eocd.cd_size);
        if cd_offset + cd_size != eocd_offset {
            return Err(RepackError::ArchiveParsingFailed(format!(
                "central directory [{cd_offset}, {}) does not end at the EOCD ({eocd_offset})",
                cd_offset + cd_size
            )));
        }

        // Pull the signing block footer in with the central directory
        let lead = cd_offset.min(APK_SIGNING_BLOCK_FOOTER_SIZE);
        let chunk = read_exact_at(reader, cd_offset - lead, (lead + cd_size) as usize)?;
        let (footer, cd) = chunk.split_at(lead as usize);

        let records = parse_central_directory(cd)?;
        if records.len() != usize::from(eocd.total_entries) {
            return Err(RepackError::ArchiveParsingFailed(format!(
                "EOCD lists {} entries, central directory holds {}",
                eocd.total_entries,
                records.len()
            )));
        }

        let signing_block_offset = find_signing_block(reader, footer, cd_offset)?;

        Ok(ArchiveLayout {
            eocd,
            eocd_offset,
            records,
            signing_block_offset
        })
    }

    /// Everything before this offset is kept when entries are appended.
    pub fn append_offset(&self) -> u64 {
        self.signing_block_offset
            .unwrap_or(u64::from(self.eocd.cd_offset))
    }
}

fn read_exact_at<R: Read + Seek>(reader: &mut R, offset: u64, len: usize) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Scans backwards for an EOCD whose comment length reaches exactly to the
/// end of the archive.
fn find_eocd<R: Read + Seek>(reader: &mut R, len: u64) -> Result<(u64, EndOfCentralDirectory)> {
    if len < EOCD_FIXED_SIZE as u64 {
        return Err(RepackError::ArchiveParsingFailed(format!(
            "{len} bytes is too small for a zip archive"
        )));
    }
    let tail_len = len.min((EOCD_FIXED_SIZE + usize::from(u16::MAX)) as u64);
    let tail_start = len - tail_len;
    let tail = read_exact_at(reader, tail_start, tail_len as usize)?;

    for i in (0..=(tail.len() - EOCD_FIXED_SIZE)).rev() {
        if &tail[i..i + 4] != EOCD_MAGIC {
            continue;
        }
        let comment_len = u16::from_le_bytes([tail[i + 20], tail[i + 21]]);
        if i + EOCD_FIXED_SIZE + usize::from(comment_len) != tail.len() {
            continue;
        }
        let (_rest, eocd) = EndOfCentralDirectory::from_bytes((&tail[i..], 0))?;
        return Ok((tail_start + i as u64, eocd));
    }

    Err(RepackError::ArchiveParsingFailed(
        "end of central directory not found".into()
    ))
}

pub fn parse_central_directory(cd: &[u8]) -> Result<Vec<CentralRecord>> {
    let mut records = vec![];
    let mut pos = 0;
    while pos < cd.len() {
        if cd.len() - pos < CD_RECORD_FIXED_SIZE {
            return Err(RepackError::ArchiveParsingFailed(format!(
                "truncated central directory record at {pos}"
            )));
        }
        let mut fields = Cursor::new(&cd[pos..pos + CD_RECORD_FIXED_SIZE]);
        if fields.read_u32::<LittleEndian>()? != CD_RECORD_MAGIC {
            return Err(RepackError::ArchiveParsingFailed(format!(
                "bad central directory signature at {pos}"
            )));
        }
        fields.set_position(28);
        let name_len = usize::from(fields.read_u16::<LittleEndian>()?);
        let extra_len = usize::from(fields.read_u16::<LittleEndian>()?);
        let comment_len = usize::from(fields.read_u16::<LittleEndian>()?);
        fields.set_position(CD_LOCAL_OFFSET_FIELD as u64);
        let local_header_offset = fields.read_u32::<LittleEndian>()?;

        let record_len = CD_RECORD_FIXED_SIZE + name_len + extra_len + comment_len;
        if cd.len() - pos < record_len {
            return Err(RepackError::ArchiveParsingFailed(format!(
                "central directory record at {pos} overruns the directory"
            )));
        }
        let raw = cd[pos..pos + record_len].to_vec();
        let name = String::from_utf8_lossy(
            &raw[CD_RECORD_FIXED_SIZE..CD_RECORD_FIXED_SIZE + name_len]
        )
        .into_owned();
        if local_header_offset == u32::MAX {
            return Err(RepackError::Zip64Unsupported(format!("entry {name}")));
        }
        records.push(CentralRecord {
            name,
            local_header_offset,
            raw
        });
        pos += record_len;
    }
    Ok(records)
}

/// `footer` holds the bytes directly before the central directory.
fn find_signing_block<R: Read + Seek>(
    reader: &mut R,
    footer: &[u8],
    cd_offset: u64
) -> Result<Option<u64>> {
    if footer.len() as u64 != APK_SIGNING_BLOCK_FOOTER_SIZE || &footer[8..] != APK_SIGNING_BLOCK_MAGIC {
        return Ok(None);
    }
    let size = Cursor::new(&footer[..8]).read_u64::<LittleEndian>()?;
    // The leading size field isn't counted in `size`
    let total = size.checked_add(8).filter(|t| *t <= cd_offset && size >= APK_SIGNING_BLOCK_FOOTER_SIZE);
    let Some(total) = total else {
        return Err(RepackError::ArchiveParsingFailed(format!(
            "APK Signing Block of {size} bytes does not fit before {cd_offset}"
        )));
    };
    let start = cd_offset - total;
    let leading = read_exact_at(reader, start, 8)?;
    if Cursor::new(leading).read_u64::<LittleEndian>()? != size {
        return Err(RepackError::ArchiveParsingFailed(
            "APK Signing Block sizes disagree".into()
        ));
    }
    Ok(Some(start))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::{write::SimpleFileOptions, ZipWriter};

    use super::*;

    fn sample(comment: &str) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("classes.dex", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"dex\n035").unwrap();
        zip.start_file("res/layout/main.xml", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"<LinearLayout/>").unwrap();
        zip.set_comment(comment);
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn finds_the_central_directory() {
        let data = sample("");
        let layout = ArchiveLayout::read(&mut Cursor::new(&data)).unwrap();
        assert_eq!(layout.eocd_offset, (data.len() - EOCD_FIXED_SIZE) as u64);
        assert_eq!(layout.records.len(), 2);
        assert_eq!(layout.records[0].name, "classes.dex");
        assert_eq!(layout.records[0].local_header_offset, 0);
        assert_eq!(layout.records[1].name, "res/layout/main.xml");
        assert_eq!(layout.signing_block_offset, None);
        assert_eq!(layout.append_offset(), u64::from(layout.eocd.cd_offset));
    }

    #[test]
    fn skips_eocd_lookalikes_inside_the_comment() {
        let data = sample("built by ci PK\u{5}\u{6} nightly");
        let layout = ArchiveLayout::read(&mut Cursor::new(&data)).unwrap();
        assert_eq!(layout.eocd.comment, b"built by ci PK\x05\x06 nightly");
        assert_eq!(layout.records.len(), 2);
    }

    #[test]
    fn rejects_saturated_fields() {
        let mut data = sample("");
        let eocd = data.len() - EOCD_FIXED_SIZE;
        data[eocd + 10..eocd + 12].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(matches!(
            ArchiveLayout::read(&mut Cursor::new(&data)),
            Err(RepackError::Zip64Unsupported(_))
        ));
    }

    #[test]
    fn rejects_non_archives() {
        let junk = vec![7u8; 4096];
        assert!(matches!(
            ArchiveLayout::read(&mut Cursor::new(&junk)),
            Err(RepackError::ArchiveParsingFailed(_))
        ));
    }

    #[test]
    fn relocates_local_header_offsets() {
        let data = sample("");
        let layout = ArchiveLayout::read(&mut Cursor::new(&data)).unwrap();
        let moved = layout.records[1].relocated(1000).unwrap();
        let reparsed = parse_central_directory(&moved).unwrap();
        assert_eq!(reparsed[0].local_header_offset, layout.records[1].local_header_offset + 1000);
        assert!(layout.records[1].relocated(u64::from(u32::MAX)).is_err());
    }
}
