//! Portfolio persistence.
//!
//! One JSON file per portfolio keyed by id, written with a temp-file plus
//! atomic rename so a crash never leaves a torn snapshot. All mutations go
//! through [`PortfolioStore::save`], which serializes writers per portfolio
//! id and emits `portfolio_updated` on the event bus. Reads hand out
//! copy-on-write `Arc` snapshots and take no lock.

use crate::events::{Event, EventBus};
use crate::portfolio::Portfolio;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: u32 = 1;

/// Storage failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("portfolio not found: {0}")]
    NotFound(String),
    #[error("portfolio already exists: {0}")]
    Conflict(String),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt portfolio snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Mutation closure applied under the per-portfolio write lock. Borrowed so
/// callers can retry the same mutation on transient storage failures.
pub type Mutator<'a> = &'a (dyn Fn(&mut Portfolio) + Send + Sync);

/// Contract consumed by the hedging engine for portfolio state.
#[async_trait]
pub trait PortfolioStore: Send + Sync {
    /// Persist a new portfolio; fails with `Conflict` if the id exists.
    async fn create(&self, portfolio: Portfolio) -> Result<Arc<Portfolio>, StoreError>;

    /// Lock-free snapshot read.
    async fn load(&self, id: &str) -> Result<Arc<Portfolio>, StoreError>;

    async fn list(&self) -> Result<Vec<Arc<Portfolio>>, StoreError>;

    /// Apply `mutator` under an exclusive per-id lock, persist, and emit
    /// `portfolio_updated` with the new snapshot.
    async fn save(&self, id: &str, mutator: Mutator<'_>) -> Result<Arc<Portfolio>, StoreError>;

    /// Remove a portfolio and emit `portfolio_deleted`.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Versioned on-disk snapshot.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    schema: u32,
    portfolio: Portfolio,
}

/// Filesystem-backed store: `<dir>/<id>.json` per portfolio.
pub struct FilePortfolioStore {
    dir: PathBuf,
    /// Copy-on-write snapshots, readable without touching disk.
    cache: RwLock<HashMap<String, Arc<Portfolio>>>,
    /// Per-portfolio write locks; entries are created on demand.
    write_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    bus: EventBus,
}

impl FilePortfolioStore {
    /// Open the store, loading every existing snapshot into the cache.
    pub fn open(dir: impl AsRef<Path>, bus: EventBus) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut cache = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_snapshot(&path) {
                Ok(portfolio) => {
                    cache.insert(portfolio.id.clone(), Arc::new(portfolio));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable portfolio snapshot");
                }
            }
        }

        info!(dir = %dir.display(), portfolios = cache.len(), "Portfolio store opened");
        Ok(Self {
            dir,
            cache: RwLock::new(cache),
            write_locks: StdMutex::new(HashMap::new()),
            bus,
        })
    }

    fn read_snapshot(path: &Path) -> Result<Portfolio, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        if snapshot.schema != SCHEMA_VERSION {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported schema {}", snapshot.schema),
            )));
        }
        Ok(snapshot.portfolio)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write the snapshot to a temp file, fsync, then rename into place.
    fn write_snapshot(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        let path = self.path_for(&portfolio.id);
        let tmp = path.with_extension("json.tmp");

        let snapshot = Snapshot {
            schema: SCHEMA_VERSION,
            portfolio: portfolio.clone(),
        };
        let raw = serde_json::to_string_pretty(&snapshot)?;

        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(raw.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        debug!(id = %portfolio.id, path = %path.display(), "Portfolio snapshot written");
        Ok(())
    }

    fn write_lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().expect("write lock map poisoned");
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn snapshot(&self, id: &str) -> Option<Arc<Portfolio>> {
        self.cache.read().expect("cache poisoned").get(id).cloned()
    }
}

#[async_trait]
impl PortfolioStore for FilePortfolioStore {
    async fn create(&self, portfolio: Portfolio) -> Result<Arc<Portfolio>, StoreError> {
        let id = portfolio.id.clone();
        let lock = self.write_lock_for(&id);
        let _guard = lock.lock().await;

        if self.snapshot(&id).is_some() || self.path_for(&id).exists() {
            return Err(StoreError::Conflict(id));
        }

        self.write_snapshot(&portfolio)?;
        let arc = Arc::new(portfolio);
        self.cache
            .write()
            .expect("cache poisoned")
            .insert(id.clone(), arc.clone());

        self.bus.publish(Event::PortfolioUpdated {
            id,
            portfolio: arc.clone(),
        });
        Ok(arc)
    }

    async fn load(&self, id: &str) -> Result<Arc<Portfolio>, StoreError> {
        self.snapshot(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Arc<Portfolio>>, StoreError> {
        let cache = self.cache.read().expect("cache poisoned");
        Ok(cache.values().cloned().collect())
    }

    async fn save(&self, id: &str, mutator: Mutator<'_>) -> Result<Arc<Portfolio>, StoreError> {
        let lock = self.write_lock_for(id);
        let _guard = lock.lock().await;

        let current = self
            .snapshot(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut next = (*current).clone();
        mutator(&mut next);

        // `updated_at` is strictly monotonic even when the wall clock is not.
        let now = Utc::now();
        next.updated_at = if now > current.updated_at {
            now
        } else {
            current.updated_at + ChronoDuration::milliseconds(1)
        };

        self.write_snapshot(&next)?;
        let arc = Arc::new(next);
        self.cache
            .write()
            .expect("cache poisoned")
            .insert(id.to_string(), arc.clone());

        self.bus.publish(Event::PortfolioUpdated {
            id: id.to_string(),
            portfolio: arc.clone(),
        });
        Ok(arc)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let lock = self.write_lock_for(id);
        let _guard = lock.lock().await;

        let removed = self
            .cache
            .write()
            .expect("cache poisoned")
            .remove(id)
            .is_some();
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        } else if !removed {
            return Err(StoreError::NotFound(id.to_string()));
        }

        self.bus.publish(Event::PortfolioDeleted { id: id.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::{LegPosition, OptionType};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn store() -> (FilePortfolioStore, tempfile::TempDir, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store = FilePortfolioStore::open(dir.path(), bus.clone()).unwrap();
        (store, dir, bus)
    }

    #[tokio::test]
    async fn create_load_round_trip() {
        let (store, _dir, _bus) = store();
        let mut p = Portfolio::new("p1", "BTC", dec!(50000));
        p.upsert_leg(LegPosition::option(
            "BTC-28JUN24-30000-C",
            dec!(-10),
            dec!(0.05),
            OptionType::Call,
            dec!(30000),
            Utc::now(),
        ));

        store.create(p).await.unwrap();
        let loaded = store.load("p1").await.unwrap();
        assert_eq!(loaded.underlying, "BTC");
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions["BTC-28JUN24-30000-C"].quantity, dec!(-10));
    }

    #[tokio::test]
    async fn create_duplicate_is_conflict() {
        let (store, _dir, _bus) = store();
        store
            .create(Portfolio::new("p1", "BTC", dec!(1)))
            .await
            .unwrap();
        let err = store
            .create(Portfolio::new("p1", "BTC", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn save_emits_event_with_monotonic_updated_at() {
        let (store, _dir, bus) = store();
        let mut rx = bus.subscribe();
        store
            .create(Portfolio::new("p1", "BTC", dec!(1000)))
            .await
            .unwrap();
        let created_at = store.load("p1").await.unwrap().updated_at;

        // Drain the create event.
        assert!(matches!(rx.recv().await.unwrap(), Event::PortfolioUpdated { .. }));

        let mut last = created_at;
        for i in 1..=3 {
            let saved = store
                .save("p1", &move |p: &mut Portfolio| p.balance += Decimal::from(i))
                .await
                .unwrap();
            assert!(saved.updated_at > last, "updated_at must increase");
            last = saved.updated_at;

            match rx.recv().await.unwrap() {
                Event::PortfolioUpdated { id, portfolio } => {
                    assert_eq!(id, "p1");
                    assert_eq!(portfolio.updated_at, last);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn snapshots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        {
            let store = FilePortfolioStore::open(dir.path(), bus.clone()).unwrap();
            store
                .create(Portfolio::new("p1", "ETH", dec!(42)))
                .await
                .unwrap();
            store
                .save("p1", &|p: &mut Portfolio| p.balance = dec!(99))
                .await
                .unwrap();
        }

        let reopened = FilePortfolioStore::open(dir.path(), bus).unwrap();
        let loaded = reopened.load("p1").await.unwrap();
        assert_eq!(loaded.balance, dec!(99));
        assert_eq!(loaded.underlying, "ETH");
    }

    #[tokio::test]
    async fn delete_removes_file_and_emits() {
        let (store, dir, bus) = store();
        let mut rx = bus.subscribe();
        store
            .create(Portfolio::new("p1", "BTC", dec!(1)))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        store.delete("p1").await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::PortfolioDeleted { .. }
        ));
        assert!(matches!(
            store.load("p1").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(!dir.path().join("p1.json").exists());
    }

    #[tokio::test]
    async fn save_missing_is_not_found() {
        let (store, _dir, _bus) = store();
        let err = store.save("ghost", &|_: &mut Portfolio| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
