//! Scheme-keyed lookup of [`Walker`] implementations.
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};
use url::Url;

use crate::walker::{NdjsonWalker, Walker};
use crate::{IngestError, IngestResult};

/// Builds a walker from the full URI it was selected by.
pub type WalkerConstructor = fn(&Url) -> IngestResult<Box<dyn Walker>>;

/// Maps lowercase scheme names to walker constructors.
#[derive(Default, Clone)]
pub struct WalkerRegistry {
    constructors: BTreeMap<String, WalkerConstructor>,
}

impl fmt::Debug for WalkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

impl WalkerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in walkers (`ndjson`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .constructors
            .insert("ndjson".to_string(), NdjsonWalker::construct);
        registry
    }

    /// Associate `scheme` with `constructor`. Registering a scheme twice is an
    /// error; the first registration is kept.
    pub fn register(&mut self, scheme: &str, constructor: WalkerConstructor) -> IngestResult<()> {
        let scheme = scheme.trim_end_matches("://").to_ascii_lowercase();
        let valid = scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid {
            return Err(IngestError::InvalidParameter {
                name: "scheme".into(),
                value: scheme,
            });
        }

        match self.constructors.entry(scheme) {
            Entry::Occupied(e) => Err(IngestError::SchemeRegistered(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(constructor);
                Ok(())
            }
        }
    }

    /// Build the walker registered for the scheme of `uri`.
    pub fn create(&self, uri: &str) -> IngestResult<Box<dyn Walker>> {
        let url = Url::parse(uri).map_err(|source| IngestError::InvalidUri {
            uri: uri.to_string(),
            source,
        })?;
        let constructor = self
            .constructors
            .get(url.scheme())
            .ok_or_else(|| IngestError::UnknownScheme(url.scheme().to_string()))?;
        constructor(&url)
    }

    /// Registered schemes as `scheme://`, sorted.
    pub fn schemes(&self) -> Vec<String> {
        self.constructors
            .keys()
            .map(|scheme| format!("{scheme}://"))
            .collect()
    }
}

static WALKERS: OnceLock<RwLock<WalkerRegistry>> = OnceLock::new();

fn walkers() -> &'static RwLock<WalkerRegistry> {
    WALKERS.get_or_init(|| RwLock::new(WalkerRegistry::with_defaults()))
}

/// Register a walker in the process-wide registry.
pub fn register_walker(scheme: &str, constructor: WalkerConstructor) -> IngestResult<()> {
    walkers()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .register(scheme, constructor)
}

/// Build a walker from the process-wide registry, e.g. `ndjson://?workers=10`.
pub fn new_walker(uri: &str) -> IngestResult<Box<dyn Walker>> {
    walkers()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .create(uri)
}

/// Schemes in the process-wide registry, for help text.
pub fn schemes() -> Vec<String> {
    walkers()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .schemes()
}
