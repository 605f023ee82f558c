#![forbid(unsafe_code)]

//! Signature derivation and specialization caches.
//!
//! A specialized loop or branch is only valid for operands that match the
//! signature it was built for. [`OperandSignature`] captures that signature
//! and [`SpecializationCache`] stores one specialization per signature.

use cf_core::{BatchAxes, DType, DeviceId, Value};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// Per-operand cache-key component.
///
/// `batch_axes` is `None` outside batched execution. Dimension sizes are not
/// part of the key: any operand of the same rank, dtype and device reuses the
/// specialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperandKey {
    pub rank: usize,
    pub dtype: DType,
    pub device: DeviceId,
    pub batch_axes: Option<BatchAxes>,
}

impl OperandKey {
    #[must_use]
    pub fn of(value: &Value) -> Self {
        Self {
            rank: value.rank(),
            dtype: value.dtype(),
            device: value.device(),
            batch_axes: None,
        }
    }

    #[must_use]
    pub fn with_batch_axes(mut self, axes: BatchAxes) -> Self {
        self.batch_axes = Some(axes);
        self
    }

    /// Whether `value` falls inside this key's specialization.
    #[must_use]
    pub fn admits(&self, value: &Value) -> bool {
        self.rank == value.rank() && self.dtype == value.dtype() && self.device == value.device()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperandSignature {
    pub stateful: bool,
    pub operands: SmallVec<[OperandKey; 4]>,
}

impl OperandSignature {
    #[must_use]
    pub fn for_values(values: &[Value], stateful: bool) -> Self {
        Self {
            stateful,
            operands: values.iter().map(OperandKey::of).collect(),
        }
    }

    /// Signature for batched execution: every operand also records its batch axes.
    pub fn for_batched(values: &[Value], axes: &[BatchAxes]) -> Result<Self, CacheKeyError> {
        if values.len() != axes.len() {
            return Err(CacheKeyError::BatchAxesCountMismatch {
                operands: values.len(),
                axes: axes.len(),
            });
        }
        Ok(Self {
            stateful: false,
            operands: values
                .iter()
                .zip(axes)
                .map(|(value, axes)| OperandKey::of(value).with_batch_axes(axes.clone()))
                .collect(),
        })
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.operands.len()
    }

    #[must_use]
    pub fn digest(&self) -> SignatureDigest {
        let mut hasher = Sha256::new();
        hasher.update(canonical_payload(self).as_bytes());
        SignatureDigest {
            namespace: "cfs",
            digest_hex: bytes_to_hex(&hasher.finalize()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureDigest {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl SignatureDigest {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKeyError {
    BatchAxesCountMismatch { operands: usize, axes: usize },
}

impl std::fmt::Display for CacheKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BatchAxesCountMismatch { operands, axes } => {
                write!(
                    f,
                    "batched signature needs one axis descriptor per operand: \
                     {operands} operands, {axes} descriptors"
                )
            }
        }
    }
}

impl std::error::Error for CacheKeyError {}

fn canonical_payload(signature: &OperandSignature) -> String {
    let operands = signature
        .operands
        .iter()
        .map(|key| {
            let axes = key.batch_axes.as_ref().map_or_else(
                || "none".to_owned(),
                |axes| {
                    axes.as_slice()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(".")
                },
            );
            format!(
                "r{}:{}:{}:{}",
                key.rank,
                key.dtype.as_str(),
                key.device.0,
                axes
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "stateful={}|arity={}|operands={}",
        signature.stateful,
        signature.arity(),
        operands
    )
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<P> {
    Hit(P),
    Miss,
}

/// One specialization per signature, built on first use.
///
/// Entries live as long as the cache. A build that fails is not stored, so the
/// next call with the same signature builds again.
pub struct SpecializationCache<P> {
    label: &'static str,
    entries: RwLock<FxHashMap<OperandSignature, P>>,
    builds: AtomicUsize,
    hits: AtomicUsize,
}

impl<P: Clone> SpecializationCache<P> {
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: RwLock::new(FxHashMap::default()),
            builds: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    pub fn lookup(&self, signature: &OperandSignature) -> CacheLookup<P> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(signature) {
            Some(entry) => CacheLookup::Hit(entry.clone()),
            None => CacheLookup::Miss,
        }
    }

    /// Return the cached specialization for `signature`, building it with
    /// `build` on a miss.
    ///
    /// `build` runs without holding the lock. If two callers race on the same
    /// signature, both build and the first insert wins.
    pub fn get_or_try_build<E>(
        &self,
        signature: &OperandSignature,
        build: impl FnOnce() -> Result<P, E>,
    ) -> Result<P, E> {
        if let CacheLookup::Hit(entry) = self.lookup(signature) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(cache = self.label, arity = signature.arity(), "specialization hit");
            return Ok(entry);
        }

        let built = build()?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            cache = self.label,
            arity = signature.arity(),
            stateful = signature.stateful,
            digest = %signature.digest().as_string(),
            "built specialization"
        );

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.entry(signature.clone()).or_insert(built).clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful builds.
    #[must_use]
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

impl<P> std::fmt::Debug for SpecializationCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecializationCache")
            .field("label", &self.label)
            .field("builds", &self.builds.load(Ordering::Relaxed))
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
