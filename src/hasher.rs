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

//! 32-bit content digests for local files, full or sampled.
//!
//! Small files and security-sensitive file types are hashed in full. Large
//! assets are sampled: a few bytes are read at a fixed stride so that checking
//! a multi-gigabyte archive stays cheap. Manifests are built with the same
//! routine, so the sampling layout must never change.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Files up to this size are always hashed in full (5 MiB).
pub const MAX_FULL_CHECK_SIZE: u64 = 5 * 1024 * 1024;

/// Distance between two sampled windows (512 KiB).
pub const SAMPLE_STRIDE: u64 = 512 * 1024;

/// Bytes read at every sampled offset.
pub const SAMPLE_LEN: usize = 4;

/// Extensions that always receive a full-content hash regardless of size.
pub const FORCED_FULL_CHECK_EXTENSIONS: &[&str] =
    &["exe", "dll", "sys", "asi", "sf", "cleo", "cs", "lua", "luac"];

const FNV_PRIME: u32 = 0x811C_9DC5;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental FNV-style hasher (multiply, then xor), seeded with zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv32 {
    state: u32,
}

impl Fnv32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state = self.state.wrapping_mul(FNV_PRIME) ^ u32::from(byte);
        }
    }

    pub fn finish(&self) -> u32 {
        self.state
    }
}

/// Hash a byte slice in one go.
pub fn fnv_hash(bytes: &[u8]) -> u32 {
    let mut hasher = Fnv32::new();
    hasher.update(bytes);
    hasher.finish()
}

/// Whether the file's extension forces a full-content hash.
pub fn is_forced_full_check(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            FORCED_FULL_CHECK_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Compute the integrity digest of a file.
///
/// Missing files, non-regular files and empty files hash to `0`.
pub fn file_hash(path: &Path) -> io::Result<u32> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() {
        return Ok(0);
    }
    let size = metadata.len();
    if size == 0 {
        return Ok(0);
    }

    let file = File::open(path)?;
    if size <= MAX_FULL_CHECK_SIZE || is_forced_full_check(path) {
        full_hash(file)
    } else {
        sampled_hash(file, size)
    }
}

fn full_hash(mut file: File) -> io::Result<u32> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut hasher = Fnv32::new();
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finish())
}

/// Number of sample bytes a file of `size` bytes may contribute.
///
/// The budget is deliberately smaller than `size / SAMPLE_STRIDE * SAMPLE_LEN`;
/// published manifests depend on this exact bound.
fn sample_budget(size: u64) -> usize {
    (size / (SAMPLE_STRIDE * (SAMPLE_LEN as u64 + 1))) as usize
}

fn sampled_hash(mut file: File, size: u64) -> io::Result<u32> {
    let budget = sample_budget(size);
    let mut window = [0u8; SAMPLE_LEN];
    let mut hasher = Fnv32::new();
    let mut sampled = 0usize;
    let mut offset = 0u64;

    while offset < size {
        if offset + SAMPLE_LEN as u64 > size || sampled + SAMPLE_LEN >= budget {
            break;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut window)?;
        hasher.update(&window);
        sampled += SAMPLE_LEN;
        offset += SAMPLE_STRIDE;
    }
    Ok(hasher.finish())
}
