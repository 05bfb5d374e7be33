/*
 * resman - Game resource update and sync engine.
 * Copyright (C) 2025  resman contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Manifest records served by every mirror.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Well-known manifest name, fetched relative to each mirror's base URL
pub const MANIFEST_FILENAME: &str = "rm_files_data.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("manifest path '{path}' rejected: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("manifest entry '{path}' is compressed but has no '{field}' field")]
    MissingCompressedField { path: String, field: &'static str },

    #[error("manifest lists '{0}' more than once")]
    Duplicate(String),
}

/// Raw on-the-wire record
#[derive(Debug, Deserialize)]
struct ManifestRecord {
    p: String,
    s: u64,
    h: u32,
    c: bool,
    #[serde(default)]
    cs: Option<u64>,
    #[serde(default)]
    ch: Option<u32>,
}

/// One file's manifest record. Equality is by path only.
#[derive(Debug, Clone, Eq)]
pub struct ResourceEntry {
    /// POSIX-style path relative to the tree's base directory
    pub relative_path: String,
    pub size: u64,
    pub hash: u32,
    pub compressed: bool,
    pub compressed_size: u64,
    pub compressed_hash: u32,
}

impl PartialEq for ResourceEntry {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path
    }
}

impl std::hash::Hash for ResourceEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.relative_path.hash(state);
    }
}

impl ResourceEntry {
    /// An uncompressed entry
    pub fn new(relative_path: impl Into<String>, size: u64, hash: u32) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
            hash,
            compressed: false,
            compressed_size: 0,
            compressed_hash: 0,
        }
    }

    /// Mark the entry as shipped in compressed form
    pub fn with_compression(mut self, compressed_size: u64, compressed_hash: u32) -> Self {
        self.compressed = true;
        self.compressed_size = compressed_size;
        self.compressed_hash = compressed_hash;
        self
    }

    /// Bytes expected on the wire when downloading this entry
    pub fn transfer_size(&self) -> u64 {
        if self.compressed {
            self.compressed_size
        } else {
            self.size
        }
    }

    /// Location of the entry below `base`
    pub fn local_path(&self, base: &Path) -> PathBuf {
        let mut path = base.to_path_buf();
        path.extend(self.relative_path.split('/'));
        path
    }

    fn from_record(record: ManifestRecord) -> Result<Self, ManifestError> {
        let relative_path = normalize_path(&record.p)?;
        let entry = ResourceEntry::new(relative_path, record.s, record.h);
        if !record.c {
            return Ok(entry);
        }
        let missing = |field| ManifestError::MissingCompressedField {
            path: entry.relative_path.clone(),
            field,
        };
        let compressed_size = record.cs.ok_or_else(|| missing("cs"))?;
        let compressed_hash = record.ch.ok_or_else(|| missing("ch"))?;
        Ok(entry.with_compression(compressed_size, compressed_hash))
    }
}

/// Normalise separators and reject anything that could escape the base directory
pub fn normalize_path(raw: &str) -> Result<String, ManifestError> {
    let invalid = |reason| ManifestError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(invalid("absolute paths are not allowed"));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(invalid("parent directory segments are not allowed")),
            _ => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Err(invalid("path is empty"));
    }
    Ok(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Parse a manifest document into entries, preserving order
pub fn parse_manifest(data: &[u8]) -> Result<Vec<ResourceEntry>, ManifestError> {
    let records: Vec<ManifestRecord> = serde_json::from_slice(data)?;
    let mut seen = HashSet::with_capacity(records.len());
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let entry = ResourceEntry::from_record(record)?;
        if !seen.insert(entry.relative_path.clone()) {
            return Err(ManifestError::Duplicate(entry.relative_path));
        }
        entries.push(entry);
    }
    Ok(entries)
}
