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

//! resman keeps a local game directory in sync with content served by CDN mirrors.
//!
//! Build one [`TransferEngine`] per process, create a [`ResourceTree`] per
//! content root, add mirrors and dependencies, then drive it with
//! `fetch_updates`, `check` and `download` while polling its accessors.

pub mod codec;
pub mod config;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod manifest;
pub mod mirror;
pub mod progress;
pub mod scheduler;
pub mod transfer;
pub mod tree;

mod util;

pub use config::{Config, LoggingConfig};
pub use error::{ErrorKind, ErrorReport, TreeError, WorkerError};
pub use manifest::ResourceEntry;
pub use mirror::{MirrorDescriptor, MirrorPool};
pub use transfer::{TransferEngine, Transport};
pub use tree::{ResourceTree, WorkerMode};
