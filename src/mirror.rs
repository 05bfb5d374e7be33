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

//! CDN mirror descriptors and the failover pool.

use crate::transfer::TransferRequest;
use crate::util::lock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// One CDN endpoint serving the manifest and per-file content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDescriptor {
    base_url: String,
    headers: HashMap<String, String>,
    is_http: bool,
    ca_bundle: Option<PathBuf>,
}

impl MirrorDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        let mut base_url = url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let is_http = base_url.starts_with("http");
        Self {
            base_url,
            headers: HashMap::new(),
            is_http,
            ca_bundle: None,
        }
    }

    /// Add or replace a request header
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn remove_header(&mut self, key: &str) {
        self.headers.remove(key);
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(key, value);
        self
    }

    /// Use a custom CA bundle (PEM) when talking to this mirror
    pub fn set_ca_bundle(&mut self, path: impl Into<PathBuf>) {
        self.ca_bundle = Some(path.into());
    }

    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.set_ca_bundle(path);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn ca_bundle(&self) -> Option<&Path> {
        self.ca_bundle.as_deref()
    }

    /// Whether the mirror speaks HTTP(S) and reports status codes
    pub fn is_http(&self) -> bool {
        self.is_http
    }

    /// Build the URL of a relative resource path.
    ///
    /// Every path segment is escaped on its own so that reserved characters
    /// inside a file name can never be mistaken for separators.
    pub fn build_url(&self, path: &str) -> String {
        let normalized = path.replace('\\', "/");
        let trimmed = normalized.strip_prefix('/').unwrap_or(&normalized);
        let escaped: Vec<String> = trimmed
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}{}", self.base_url, escaped.join("/"))
    }

    /// Prepare a transfer request for a relative resource path
    pub fn request(&self, path: &str) -> TransferRequest {
        let headers = if self.is_http {
            self.headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            Vec::new()
        };
        TransferRequest {
            url: self.build_url(path),
            headers,
            ca_bundle: self.ca_bundle.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Selection {
    current: Option<usize>,
    errors: usize,
}

/// Ordered set of mirrors with error-driven failover.
///
/// One mirror is active at a time. Once it accumulates `max_errors`
/// consecutive errors, a different mirror is picked at random.
#[derive(Debug)]
pub struct MirrorPool {
    mirrors: RwLock<Vec<Arc<MirrorDescriptor>>>,
    selection: Mutex<Selection>,
    max_errors: usize,
}

impl MirrorPool {
    pub fn new(max_errors: usize) -> Self {
        Self {
            mirrors: RwLock::new(Vec::new()),
            selection: Mutex::new(Selection::default()),
            max_errors,
        }
    }

    /// Append a mirror. The active selection is reset.
    pub fn push(&self, mirror: MirrorDescriptor) {
        let mut mirrors = self
            .mirrors
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        mirrors.push(Arc::new(mirror));
        *lock(&self.selection) = Selection::default();
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_errors(&self) -> usize {
        self.max_errors
    }

    fn snapshot(&self) -> Vec<Arc<MirrorDescriptor>> {
        self.mirrors
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The active mirror, without triggering a selection
    pub fn current(&self) -> Option<Arc<MirrorDescriptor>> {
        let index = lock(&self.selection).current?;
        self.snapshot().get(index).cloned()
    }

    /// Consecutive errors recorded against the active mirror
    pub fn error_count(&self) -> usize {
        lock(&self.selection).errors
    }

    /// Record one failed request against the active mirror
    pub fn record_error(&self) {
        let mut selection = lock(&self.selection);
        selection.errors += 1;
        if selection.errors == self.max_errors {
            warn!(
                "mirror reached {} consecutive errors, failing over",
                self.max_errors
            );
        }
    }

    /// Return the mirror to use for the next request, failing over if needed
    pub fn select(&self) -> Option<Arc<MirrorDescriptor>> {
        self.select_seeded(time_seed())
    }

    /// Selection with an explicit seed for the random replacement pick
    pub fn select_seeded(&self, seed: u64) -> Option<Arc<MirrorDescriptor>> {
        let mirrors = self.snapshot();
        let count = mirrors.len();
        if count == 0 {
            return None;
        }

        let mut selection = lock(&self.selection);
        let exhausted = count > 1 && selection.errors >= self.max_errors;
        if selection.current.is_none() || exhausted {
            let next = match selection.current {
                _ if count == 1 => 0,
                None => sample(seed, count),
                Some(active) if count == 2 => 1 - active,
                Some(active) => {
                    let mut seed = seed;
                    loop {
                        let picked = sample(seed, count);
                        if picked != active {
                            break picked;
                        }
                        seed = seed.wrapping_add(1);
                    }
                }
            };
            if selection.current.is_some() {
                info!("switching to mirror {}", mirrors[next].base_url());
            }
            selection.current = Some(next);
            selection.errors = 0;
        }

        selection.current.and_then(|index| mirrors.get(index).cloned())
    }
}

fn sample(seed: u64, count: usize) -> usize {
    StdRng::seed_from_u64(seed).random_range(0..count)
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
