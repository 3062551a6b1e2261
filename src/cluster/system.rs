//! CONCLAVE - System Store
//! The node's own small key space: its identifier and lifecycle facts,
//! persisted in a dedicated engine next to (not inside) namespace storage.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::NodeConfig;
use crate::engine::LsmTree;
use crate::error::{ConclaveError, Result};

const STEM: &str = "system";
const IDENTIFIER: &str = "identifier";
const STATE: &str = "state";
const LAST_STARTED_AT: &str = "last_started_at";
const LAST_VERSION: &str = "last_version";

/// Lifecycle of a node as recorded in its system store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(LifecycleState::Starting),
            "running" => Ok(LifecycleState::Running),
            "stopping" => Ok(LifecycleState::Stopping),
            "stopped" => Ok(LifecycleState::Stopped),
            other => Err(ConclaveError::Corruption(format!("unknown lifecycle state {other:?}"))),
        }
    }
}

pub struct SystemStore {
    engine: LsmTree,
    identifier: String,
    previous: Option<LifecycleState>,
}

impl SystemStore {
    /// Open the store and establish the node identifier.
    ///
    /// On first start the identifier comes from `config.identifier` or a fresh
    /// UUID and is persisted before anything else. A store that has recorded a
    /// start but holds no identifier cannot be trusted and is unrecoverable.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let engine = LsmTree::open(config.system_storage(), STEM)?;

        let previous = match engine.get(STATE)? {
            Some(raw) => Some(raw.parse::<LifecycleState>()?),
            None => None,
        };

        let identifier = match (engine.get(IDENTIFIER)?, previous) {
            (Some(id), _) => {
                if let Some(wanted) = config.identifier.as_deref() {
                    if wanted != id {
                        log::warn!("ignoring configured identifier {wanted:?}, store holds {id:?}");
                    }
                }
                id
            }
            (None, Some(state)) => {
                return Err(ConclaveError::Unrecoverable(format!(
                    "system store at {:?} records state {state} but no identifier",
                    config.system_store_path
                )))
            }
            (None, None) => {
                let id = config
                    .identifier
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                engine.put(IDENTIFIER, &id).map_err(|e| {
                    ConclaveError::Unrecoverable(format!("cannot persist node identifier: {e}"))
                })?;
                log::info!("assigned node identifier {id}");
                id
            }
        };

        match previous {
            Some(LifecycleState::Stopped) | None => {}
            Some(state) => log::warn!("node {identifier} did not shut down cleanly (last state {state})"),
        }

        Ok(Self {
            engine,
            identifier,
            previous,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// State recorded by the previous run, if any.
    pub fn previous_state(&self) -> Option<LifecycleState> {
        self.previous
    }

    pub fn state(&self) -> Result<Option<LifecycleState>> {
        self.engine.get(STATE)?.map(|raw| raw.parse()).transpose()
    }

    pub fn set_state(&self, state: LifecycleState) -> Result<()> {
        log::debug!("lifecycle state {state}");
        self.engine.put(STATE, state.as_str())
    }

    /// Record the start of this run: time, version and `Starting`.
    pub fn record_start(&self, version: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.engine.put(LAST_STARTED_AT, &now.to_string())?;
        self.engine.put(LAST_VERSION, version)?;
        self.set_state(LifecycleState::Starting)
    }

    pub fn last_started_at(&self) -> Result<Option<u64>> {
        match self.engine.get(LAST_STARTED_AT)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConclaveError::Corruption(format!("bad start time {raw:?}"))),
            None => Ok(None),
        }
    }

    pub fn last_version(&self) -> Result<Option<String>> {
        self.engine.get(LAST_VERSION)
    }

    pub fn close(&self) -> Result<()> {
        self.engine.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            sync_writes: false,
            ..NodeConfig::new(dir)
        }
    }

    #[test]
    fn test_first_start_persists_configured_identifier() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SystemStore::open(&config(dir.path()).with_identifier("node-a")).unwrap();
            assert_eq!(store.identifier(), "node-a");
            assert_eq!(store.previous_state(), None);
        }
        let store = SystemStore::open(&config(dir.path())).unwrap();
        assert_eq!(store.identifier(), "node-a");
    }

    #[test]
    fn test_generated_identifier_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = SystemStore::open(&config(dir.path())).unwrap().identifier().to_string();
        assert!(uuid::Uuid::parse_str(&first).is_ok());
        let second = SystemStore::open(&config(dir.path())).unwrap().identifier().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_lifecycle_recorded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SystemStore::open(&config(dir.path())).unwrap();
            store.record_start("1.2.3").unwrap();
            store.set_state(LifecycleState::Running).unwrap();
            assert_eq!(store.state().unwrap(), Some(LifecycleState::Running));
            assert!(store.last_started_at().unwrap().is_some());
        }
        let store = SystemStore::open(&config(dir.path())).unwrap();
        assert_eq!(store.previous_state(), Some(LifecycleState::Running));
        assert_eq!(store.last_version().unwrap(), Some("1.2.3".to_string()));
    }

    #[test]
    fn test_state_without_identifier_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = LsmTree::open(config(dir.path()).system_storage(), STEM).unwrap();
            engine.put(STATE, "stopped").unwrap();
        }
        assert!(matches!(
            SystemStore::open(&config(dir.path())),
            Err(ConclaveError::Unrecoverable(_))
        ));
    }

    #[test]
    fn test_lifecycle_state_parse() {
        assert_eq!("stopping".parse::<LifecycleState>().unwrap(), LifecycleState::Stopping);
        assert!("paused".parse::<LifecycleState>().is_err());
    }
}
