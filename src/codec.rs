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

//! Streaming single-file zstd compression with content checksums.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Suffix appended to an entry's path while its compressed payload is on disk.
pub const COMPRESSED_SUFFIX: &str = ".zst";

/// Compression level used by the manifest builder.
pub const DEFAULT_LEVEL: i32 = 3;

/// Matches zstd's recommended streaming output size.
const STREAM_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("could not locate input file '{}'", .0.display())]
    MissingInput(PathBuf),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zstd error while compressing '{}': {source}", .path.display())]
    Compress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zstd error while decompressing '{}': {source}", .path.display())]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CodecError {
    /// OS error code of an underlying filesystem failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CodecError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CodecError + '_ {
    move |source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open_input(path: &Path) -> Result<File, CodecError> {
    if !path.is_file() {
        return Err(CodecError::MissingInput(path.to_path_buf()));
    }
    File::open(path).map_err(io_err(path))
}

fn create_output(path: &Path) -> Result<File, CodecError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }
    File::create(path).map_err(io_err(path))
}

/// Worker threads handed to zstd: half the cores, only when more than two exist.
fn compression_workers() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cores > 2 {
        (cores / 2) as u32
    } else {
        0
    }
}

/// Compress `input` into `output`. Returns the number of compressed bytes written.
///
/// On error the output may be left partially written; callers remove it.
pub fn compress_file(input: &Path, output: &Path, level: i32) -> Result<u64, CodecError> {
    let mut source = open_input(input)?;
    let target = create_output(output)?;

    let compress_err = |source| CodecError::Compress {
        path: input.to_path_buf(),
        source,
    };

    let mut encoder =
        zstd::stream::write::Encoder::new(BufWriter::new(target), level).map_err(compress_err)?;
    encoder.include_checksum(true).map_err(compress_err)?;
    let workers = compression_workers();
    if workers > 0 {
        encoder.multithread(workers).map_err(compress_err)?;
    }

    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(input)(e)),
        };
        encoder.write_all(&buffer[..read]).map_err(compress_err)?;
    }

    let mut writer = encoder.finish().map_err(compress_err)?;
    writer.flush().map_err(io_err(output))?;
    drop(writer);

    let written = fs::metadata(output).map_err(io_err(output))?.len();
    debug!(
        "compressed {} -> {} ({} bytes)",
        input.display(),
        output.display(),
        written
    );
    Ok(written)
}

/// Decompress `input` into `output` through fixed-size buffers.
/// Returns the number of decompressed bytes written.
///
/// On error the output may be left partially written; callers remove it.
pub fn decompress_file(input: &Path, output: &Path) -> Result<u64, CodecError> {
    let source = open_input(input)?;
    let target = create_output(output)?;

    let decompress_err = |source| CodecError::Decompress {
        path: input.to_path_buf(),
        source,
    };

    let mut decoder = zstd::stream::read::Decoder::new(source).map_err(decompress_err)?;
    let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, target);
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let read = match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(decompress_err(e)),
        };
        writer.write_all(&buffer[..read]).map_err(io_err(output))?;
        written += read as u64;
    }
    writer.flush().map_err(io_err(output))?;

    debug!(
        "decompressed {} -> {} ({} bytes)",
        input.display(),
        output.display(),
        written
    );
    Ok(written)
}
