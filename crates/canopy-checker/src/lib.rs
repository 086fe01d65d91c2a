//! Canopy Checker -- the pluggable unit-of-work evaluator.
//!
//! A `Checker` maps one 64-bit value to a result line. Nodes resolve a
//! checker from a named artifact (fetched by URL) and an entry-point name;
//! the distribution and protocol layers are agnostic to how resolution
//! happens, so alternative resolvers (dylib loading, subprocess, embedded
//! interpreter) can be slotted in behind [`CheckerResolver`].

pub mod fetch;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use fetch::{fetch_artifact, FetchError};

/// The user-supplied predicate under test.
pub trait Checker: Send + Sync {
    fn check(&self, value: i64) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("artifact not found: {0}")]
    ArtifactMissing(String),
    #[error("unknown entry point: {0}")]
    UnknownEntryPoint(String),
}

/// Resolution seam between the job layer and whatever actually hosts the
/// checker code.
pub trait CheckerResolver: Send + Sync {
    fn resolve(
        &self,
        artifact: &Path,
        entry_point: &str,
    ) -> Result<Arc<dyn Checker>, ResolveError>;

    /// Toggle reuse of previously resolved checkers.
    fn set_cache_enabled(&self, enabled: bool);
}

// ============================================================================
// Built-in checkers
// ============================================================================

/// Steps for the Collatz sequence of `value` to reach 1.
struct Collatz;

impl Checker for Collatz {
    fn check(&self, value: i64) -> String {
        if value <= 0 {
            return format!("{value} is out of domain");
        }
        let mut n = value as u128;
        let mut steps = 0u32;
        while n != 1 {
            n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
            steps += 1;
        }
        format!("{value} reaches 1 in {steps} steps")
    }
}

/// Parity predicate, handy for eyeballing output files.
struct Even;

impl Checker for Even {
    fn check(&self, value: i64) -> String {
        format!("{value} {}", if value % 2 == 0 { "even" } else { "odd" })
    }
}

/// Collatz with a deliberate per-value delay, for exercising refusal and
/// leave paths while work is still in flight.
struct Slow;

impl Checker for Slow {
    fn check(&self, value: i64) -> String {
        std::thread::sleep(std::time::Duration::from_millis(2));
        Collatz.check(value)
    }
}

// ============================================================================
// Registry resolver
// ============================================================================

/// Resolver backed by a registry of built-in checkers, keyed by entry-point
/// name. The artifact file must exist (it was fetched for this job), but
/// its contents are not interpreted here.
pub struct BuiltinResolver {
    cache: Mutex<HashMap<String, Arc<dyn Checker>>>,
    cache_enabled: std::sync::atomic::AtomicBool,
}

impl BuiltinResolver {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            cache_enabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn instantiate(entry_point: &str) -> Option<Arc<dyn Checker>> {
        match entry_point {
            "collatz" => Some(Arc::new(Collatz)),
            "even" => Some(Arc::new(Even)),
            "slow" => Some(Arc::new(Slow)),
            _ => None,
        }
    }
}

impl Default for BuiltinResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckerResolver for BuiltinResolver {
    fn resolve(
        &self,
        artifact: &Path,
        entry_point: &str,
    ) -> Result<Arc<dyn Checker>, ResolveError> {
        if !artifact.exists() {
            return Err(ResolveError::ArtifactMissing(
                artifact.display().to_string(),
            ));
        }

        if self
            .cache_enabled
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            if let Some(cached) = self.cache.lock().unwrap().get(entry_point) {
                tracing::debug!(entry_point, "checker: cache hit");
                return Ok(cached.clone());
            }
        }

        let checker = Self::instantiate(entry_point)
            .ok_or_else(|| ResolveError::UnknownEntryPoint(entry_point.to_string()))?;
        self.cache
            .lock()
            .unwrap()
            .insert(entry_point.to_string(), checker.clone());
        Ok(checker)
    }

    fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(enabled, "checker: cache toggled");
    }
}
