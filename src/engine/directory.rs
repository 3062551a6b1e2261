//! CONCLAVE - Namespace Storage Directory
//! Maps each namespace to its own lazily opened LSM engine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::Result;
use crate::types::Namespace;

use super::LsmTree;

/// Thread-safe namespace → engine map.
///
/// Reads of a namespace that has never been written do not create any files.
pub struct StorageDirectory {
    config: Config,
    engines: RwLock<HashMap<Namespace, Arc<LsmTree>>>,
    /// Stems found on disk at open plus every stem opened since.
    known_stems: RwLock<HashSet<String>>,
}

impl StorageDirectory {
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let known_stems = LsmTree::stems_on_disk(&config)?;
        log::info!(
            "storage directory at {:?} ({} stems on disk)",
            config.data_dir,
            known_stems.len()
        );
        Ok(Self {
            config,
            engines: RwLock::new(HashMap::new()),
            known_stems: RwLock::new(known_stems),
        })
    }

    fn loaded(&self, namespace: &Namespace) -> Option<Arc<LsmTree>> {
        let engines = self.engines.read().unwrap_or_else(|e| e.into_inner());
        engines.get(namespace).cloned()
    }

    /// Engine for `namespace`, opening (and creating) it on first use.
    pub fn engine(&self, namespace: &Namespace) -> Result<Arc<LsmTree>> {
        if let Some(engine) = self.loaded(namespace) {
            return Ok(engine);
        }
        let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
        if let Some(engine) = engines.get(namespace) {
            return Ok(Arc::clone(engine));
        }
        let engine = Arc::new(LsmTree::open(self.config.clone(), namespace.file_stem())?);
        engines.insert(namespace.clone(), Arc::clone(&engine));
        self.known_stems
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(namespace.file_stem().to_string());
        log::debug!("namespace {:?} opened", namespace.as_str());
        Ok(engine)
    }

    /// Engine for `namespace` only if it is loaded or has files on disk.
    fn existing(&self, namespace: &Namespace) -> Result<Option<Arc<LsmTree>>> {
        if let Some(engine) = self.loaded(namespace) {
            return Ok(Some(engine));
        }
        let known = self
            .known_stems
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(namespace.file_stem());
        if known {
            return self.engine(namespace).map(Some);
        }
        Ok(None)
    }

    pub fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<String>> {
        match self.existing(namespace)? {
            Some(engine) => engine.get(key),
            None => Ok(None),
        }
    }

    pub fn set(&self, namespace: &Namespace, key: &str, value: &str) -> Result<()> {
        self.engine(namespace)?.put(key, value)
    }

    pub fn delete(&self, namespace: &Namespace, key: &str) -> Result<()> {
        self.engine(namespace)?.remove(key)
    }

    /// Namespaces currently loaded, sorted.
    pub fn namespaces(&self) -> Vec<Namespace> {
        let engines = self.engines.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<Namespace> = engines.keys().cloned().collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<LsmTree>> {
        let engines = self.engines.read().unwrap_or_else(|e| e.into_inner());
        engines.values().cloned().collect()
    }

    /// Flush every loaded engine. Returns how many produced a segment.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        for engine in self.all() {
            if engine.flush()?.is_some() {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Compact every loaded engine. Returns the total number of merges.
    pub fn compact_all(&self) -> Result<usize> {
        let mut merges = 0;
        for engine in self.all() {
            merges += engine.compact()?;
        }
        Ok(merges)
    }

    /// Close every engine's WAL and forget the engines.
    pub fn close_all(&self) -> Result<()> {
        let engines: Vec<(Namespace, Arc<LsmTree>)> = {
            let mut engines = self.engines.write().unwrap_or_else(|e| e.into_inner());
            engines.drain().collect()
        };
        let mut first_error = None;
        for (namespace, engine) in engines {
            if let Err(e) = engine.close() {
                log::error!("closing namespace {:?}: {}", namespace.as_str(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Metrics reports for every loaded namespace.
    pub fn report(&self) -> String {
        let engines = self.engines.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&Namespace> = engines.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let engine = &engines[name];
            out.push_str(&format!(
                "[{}] segments={} memtable={}\n{}\n",
                name,
                engine.segment_count(),
                engine.memtable_len(),
                engine.metrics().report()
            ));
        }
        out
    }
}
