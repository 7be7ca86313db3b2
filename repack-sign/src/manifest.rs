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

//! `META-INF/MANIFEST.MF` as a list of blocks. Entry records are parsed
//! structurally, everything else is carried through byte-for-byte.

use repack_common::*;

/// Longest line written before folding, excluding CRLF.
pub const LINE_WIDTH: usize = 70;
const CRLF: &[u8] = b"\r\n";
const NAME_PREFIX: &[u8] = b"Name: ";

/// Folds `line` to [LINE_WIDTH]: the first 70 bytes, then chunks of 69 each
/// behind a single space. Every physical line ends with CRLF.
pub fn fold_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + line.len() / (LINE_WIDTH - 1) * 3 + 2);
    let (first, mut rest) = line.split_at(line.len().min(LINE_WIDTH));
    out.extend_from_slice(first);
    out.extend_from_slice(CRLF);
    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(rest.len().min(LINE_WIDTH - 1));
        out.push(b' ');
        out.extend_from_slice(chunk);
        out.extend_from_slice(CRLF);
        rest = tail;
    }
    out
}

/// An entry record: the `Name:` line and its continuations, followed by the
/// attribute lines (the digest) up to the next blank line. Lines keep their
/// CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    name_lines: Vec<Vec<u8>>,
    attribute_lines: Vec<Vec<u8>>
}

impl EntryRecord {
    fn new(name: &[u8], attribute: &[u8]) -> Self {
        let mut name_line = NAME_PREFIX.to_vec();
        name_line.extend_from_slice(name);
        EntryRecord {
            name_lines: split_lines(&fold_line(&name_line)),
            attribute_lines: split_lines(&fold_line(attribute))
        }
    }

    /// The unfolded entry name.
    pub fn name(&self) -> Vec<u8> {
        let mut lines = self.name_lines.iter().map(|l| strip_crlf(l));
        let mut name = lines
            .next()
            .map(|first| first[NAME_PREFIX.len()..].to_vec())
            .unwrap_or_default();
        for continuation in lines {
            name.extend_from_slice(&continuation[1..]);
        }
        name
    }

    /// The record as it appears in the manifest, plus the blank line that
    /// closes it. This is what the signature file digests.
    pub fn section_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self
            .name_lines
            .iter()
            .chain(&self.attribute_lines)
            .flatten()
            .copied()
            .collect();
        out.extend_from_slice(CRLF);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for line in self.name_lines.iter().chain(&self.attribute_lines) {
            out.extend_from_slice(line);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    /// Main attributes, blank lines and anything else we don't interpret
    Raw(Vec<u8>),
    Entry(EntryRecord)
}

/// A parsed manifest. Serialises back to the input bytes unless modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    blocks: Vec<Block>
}

fn strip_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(CRLF).unwrap_or(line)
}

/// Splits into physical lines, each keeping its CRLF. A final line without
/// one is returned as is.
fn split_lines(data: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = vec![];
    let mut start = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        if &data[i..i + 2] == CRLF {
            lines.push(data[start..i + 2].to_vec());
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    if start < data.len() {
        lines.push(data[start..].to_vec());
    }
    lines
}

fn is_blank(line: &[u8]) -> bool {
    line == CRLF
}

impl Manifest {
    pub fn parse(data: &[u8]) -> Result<Manifest> {
        let lines = split_lines(data);
        let mut blocks = vec![];
        let mut i = 0;

        while i < lines.len() {
            if !lines[i].starts_with(NAME_PREFIX) {
                match blocks.last_mut() {
                    Some(Block::Raw(raw)) => raw.extend_from_slice(&lines[i]),
                    _ => blocks.push(Block::Raw(lines[i].clone()))
                }
                i += 1;
                continue;
            }

            let start = i;
            i += 1;
            while i < lines.len() && lines[i].starts_with(b" ") {
                i += 1;
            }
            let name_end = i;
            while i < lines.len() && !is_blank(&lines[i]) {
                i += 1;
            }

            let record = EntryRecord {
                name_lines: lines[start..name_end].to_vec(),
                attribute_lines: lines[name_end..i].to_vec()
            };
            let name = String::from_utf8_lossy(&record.name()).into_owned();
            if record.attribute_lines.is_empty() {
                return Err(RepackError::MalformedManifest(format!("{name} has no digest line")));
            }
            if lines[start..i].iter().any(|l| !l.ends_with(CRLF)) {
                return Err(RepackError::MalformedManifest(format!(
                    "{name} is not terminated before the end of the manifest"
                )));
            }
            blocks.push(Block::Entry(record));
        }

        Ok(Manifest { blocks })
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntryRecord> {
        self.blocks.iter().filter_map(|b| match b {
            Block::Entry(e) => Some(e),
            Block::Raw(_) => None
        })
    }

    /// Points the record for `name` at `digest_line`, which is written folded.
    ///
    /// The first record of that name keeps its position and loses its old
    /// attribute lines, later duplicates are dropped. Without one, a record
    /// is appended as its own section.
    pub fn set_entry_digest(&mut self, name: &[u8], digest_line: &[u8]) {
        let replacement = EntryRecord::new(name, digest_line);
        let mut found = false;
        let mut i = 0;
        while i < self.blocks.len() {
            let matches = matches!(&self.blocks[i], Block::Entry(e) if e.name() == name);
            if !matches {
                i += 1;
                continue;
            }
            if !found {
                if let Block::Entry(record) = &mut self.blocks[i] {
                    record.attribute_lines = replacement.attribute_lines.clone();
                }
                found = true;
                i += 1;
                continue;
            }
            // Drop the duplicate with the blank line that closed it
            self.blocks.remove(i);
            if let Some(Block::Raw(raw)) = self.blocks.get_mut(i) {
                if raw.starts_with(CRLF) {
                    raw.drain(..CRLF.len());
                    if raw.is_empty() {
                        self.blocks.remove(i);
                    }
                }
            }
        }
        if found {
            return;
        }

        let current = self.to_bytes();
        let separator: &[u8] = if current.is_empty() || current.ends_with(b"\r\n\r\n") {
            b""
        } else if current.ends_with(CRLF) {
            CRLF
        } else {
            b"\r\n\r\n"
        };
        if !separator.is_empty() {
            self.push_raw(separator);
        }
        self.blocks.push(Block::Entry(replacement));
        self.push_raw(CRLF);
    }

    fn push_raw(&mut self, data: &[u8]) {
        match self.blocks.last_mut() {
            Some(Block::Raw(raw)) => raw.extend_from_slice(data),
            _ => self.blocks.push(Block::Raw(data.to_vec()))
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        for block in &self.blocks {
            match block {
                Block::Raw(raw) => out.extend_from_slice(raw),
                Block::Entry(record) => record.write_to(&mut out)
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &[u8] = b"assets/dap.properties";

    const SIGNED: &[u8] = b"Manifest-Version: 1.0\r\nCreated-By: 1.0 (Android)\r\n\r\n\
Name: AndroidManifest.xml\r\nSHA1-Digest: 2f2nZGhfQhEHKhF1kUb6eCyEN0Y=\r\n\r\n\
Name: classes.dex\r\nSHA1-Digest: Jr5eg4nyoXRqhpJ5S4mfA46kjnk=\r\n\r\n";

    fn marker_records(manifest: &Manifest) -> usize {
        manifest.entries().filter(|e| e.name() == MARKER).count()
    }

    #[test]
    fn round_trips_unmodified_manifests() {
        let manifest = Manifest::parse(SIGNED).unwrap();
        assert_eq!(manifest.to_bytes(), SIGNED);
        let names: Vec<_> = manifest.entries().map(|e| e.name()).collect();
        assert_eq!(names, vec![b"AndroidManifest.xml".to_vec(), b"classes.dex".to_vec()]);
    }

    #[test]
    fn folds_long_lines() {
        assert_eq!(fold_line(b"short"), b"short\r\n");
        let exact = vec![b'a'; 70];
        assert_eq!(fold_line(&exact).len(), 72);

        let long = vec![b'x'; 70 + 69 + 5];
        let folded = fold_line(&long);
        let lines = split_lines(&folded);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), 72);
        assert_eq!(lines[1].len(), 72);
        assert_eq!(lines[2], b" xxxxx\r\n");
    }

    #[test]
    fn unfolds_long_names() {
        let name = format!("res/{}.png", "drawable-xxhdpi/ic_launcher_foreground".repeat(3));
        let mut data = SIGNED.to_vec();
        data.extend(fold_line(format!("Name: {name}").as_bytes()));
        data.extend(b"SHA1-Digest: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\r\n");
        let manifest = Manifest::parse(&data).unwrap();
        let last = manifest.entries().last().unwrap();
        assert_eq!(last.name(), name.as_bytes());
        assert!(last.name_lines.len() > 1);
        assert_eq!(manifest.to_bytes(), data);
    }

    #[test]
    fn appends_the_marker_once() {
        let mut manifest = Manifest::parse(SIGNED).unwrap();
        manifest.set_entry_digest(MARKER, b"SHA1-Digest: first=");
        let once = manifest.to_bytes();
        assert!(once.starts_with(SIGNED));
        assert!(once.ends_with(b"Name: assets/dap.properties\r\nSHA1-Digest: first=\r\n\r\n"));

        // Patching the patched manifest updates in place
        let mut again = Manifest::parse(&once).unwrap();
        again.set_entry_digest(MARKER, b"SHA1-Digest: second=");
        assert_eq!(marker_records(&again), 1);
        let twice = again.to_bytes();
        assert_eq!(twice.len(), once.len() + 1);
        assert!(twice.ends_with(b"SHA1-Digest: second=\r\n\r\n"));
    }

    #[test]
    fn replaces_existing_marker_in_place() {
        let data = b"Manifest-Version: 1.0\r\n\r\n\
Name: assets/dap.properties\r\nSHA1-Digest: old=\r\n\r\n\
Name: classes.dex\r\nSHA1-Digest: dex=\r\n\r\n";
        let mut manifest = Manifest::parse(data).unwrap();
        manifest.set_entry_digest(MARKER, b"SHA1-Digest: new=");
        assert_eq!(
            manifest.to_bytes(),
            b"Manifest-Version: 1.0\r\n\r\n\
Name: assets/dap.properties\r\nSHA1-Digest: new=\r\n\r\n\
Name: classes.dex\r\nSHA1-Digest: dex=\r\n\r\n"
        );
    }

    #[test]
    fn removes_duplicate_markers() {
        let data = b"Manifest-Version: 1.0\r\n\r\n\
Name: assets/dap.properties\r\nSHA1-Digest: a=\r\n\r\n\
Name: classes.dex\r\nSHA1-Digest: dex=\r\n\r\n\
Name: assets/dap.properties\r\nSHA1-Digest: b=\r\n\r\n";
        let mut manifest = Manifest::parse(data).unwrap();
        manifest.set_entry_digest(MARKER, b"SHA1-Digest: c=");
        assert_eq!(marker_records(&manifest), 1);
        assert_eq!(
            manifest.to_bytes(),
            b"Manifest-Version: 1.0\r\n\r\n\
Name: assets/dap.properties\r\nSHA1-Digest: c=\r\n\r\n\
Name: classes.dex\r\nSHA1-Digest: dex=\r\n\r\n"
        );
    }

    #[test]
    fn inserts_a_separator_when_the_last_section_is_open() {
        let mut manifest = Manifest::parse(b"Manifest-Version: 1.0\r\n").unwrap();
        manifest.set_entry_digest(MARKER, b"SHA1-Digest: x=");
        assert_eq!(
            manifest.to_bytes(),
            b"Manifest-Version: 1.0\r\n\r\nName: assets/dap.properties\r\nSHA1-Digest: x=\r\n\r\n"
        );
    }

    #[test]
    fn rejects_records_without_digest() {
        let truncated = b"Manifest-Version: 1.0\r\n\r\nName: classes.dex\r\n\r\n";
        assert!(matches!(
            Manifest::parse(truncated),
            Err(RepackError::MalformedManifest(_))
        ));
        let unterminated = b"Manifest-Version: 1.0\r\n\r\nName: classes.dex\r\nSHA1-Digest: x=";
        assert!(matches!(
            Manifest::parse(unterminated),
            Err(RepackError::MalformedManifest(_))
        ));
    }
}
