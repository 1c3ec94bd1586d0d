// =============================================================================
// PositionStore — id-indexed durable position state (§4.6, C6)
// =============================================================================
//
// The only source of truth for position state in memory (§5, "Shared
// state"). Every mutation persists through the same atomic tmp+rename
// pattern as the teacher's `RuntimeConfig`, and retention is applied on both
// load and save: every ACTIVE position is kept, plus the 100 newest CLOSED;
// the rest are dropped.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::{Position, PositionStatus, Timeframe};

const MAX_RETAINED_CLOSED: usize = 100;

pub struct PositionStore {
    positions: RwLock<HashMap<String, Position>>,
    path: PathBuf,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            path: path.into(),
        }
    }

    /// Load persisted positions, applying retention immediately.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read position store from {}", self.path.display()))?;
        let loaded: Vec<Position> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse position store from {}", self.path.display()))?;

        let retained = apply_retention(loaded);
        let mut map = HashMap::with_capacity(retained.len());
        for p in retained {
            map.insert(p.id.clone(), p);
        }
        let count = map.len();
        *self.positions.write() = map;
        info!(count, path = %self.path.display(), "position store loaded");
        Ok(())
    }

    /// Persist the current state, applying retention first (§4.6).
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let mut positions = self.positions.write();
            let retained = apply_retention(positions.values().cloned().collect());
            let mut map = HashMap::with_capacity(retained.len());
            for p in &retained {
                map.insert(p.id.clone(), p.clone());
            }
            *positions = map;
            retained
        };

        let content = serde_json::to_string_pretty(&snapshot).context("failed to serialize positions")?;
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp position store to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp position store to {}", self.path.display()))?;
        Ok(())
    }

    pub fn insert(&self, position: Position) -> Result<()> {
        self.positions.write().insert(position.id.clone(), position);
        if let Err(err) = self.save() {
            warn!(%err, "failed to persist position store after insert");
            return Err(err);
        }
        Ok(())
    }

    pub fn update(&self, position: Position) -> Result<()> {
        self.insert(position)
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        self.positions.read().get(id).cloned()
    }

    /// Projection: the single ACTIVE position for `tf`, if any (§4.6).
    pub fn active_by_timeframe(&self, tf: Timeframe) -> Option<Position> {
        self.positions
            .read()
            .values()
            .find(|p| p.timeframe == tf && p.status == PositionStatus::Active)
            .cloned()
    }

    pub fn all_active(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.status == PositionStatus::Active)
            .cloned()
            .collect()
    }

    /// Listing projection, O(n log n) (§4.6).
    pub fn all_sorted_by_created_at_desc(&self, limit: Option<usize>) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.read().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        all
    }
}

fn apply_retention(mut positions: Vec<Position>) -> Vec<Position> {
    let (mut active, mut closed): (Vec<Position>, Vec<Position>) =
        (Vec::new(), Vec::new());
    positions.drain(..).for_each(|p| match p.status {
        PositionStatus::Active => active.push(p),
        PositionStatus::Closed => closed.push(p),
    });

    closed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    closed.truncate(MAX_RETAINED_CLOSED);

    active.extend(closed);
    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinRange, PriceRange, Side};

    fn position(id: &str, status: PositionStatus, created_at: i64) -> Position {
        Position {
            id: id.to_string(),
            pool_id: "pool".to_string(),
            timeframe: Timeframe::H1,
            side: Side::Buy,
            amount: 1.0,
            entry_price: 100.0,
            created_at,
            status,
            price_range: PriceRange {
                min: 90.0,
                max: 110.0,
                bin_range: BinRange { min_bin: 1, max_bin: 10 },
            },
            last_range_check: 0,
            has_been_harvested: false,
            last_harvest_at: None,
            closed_at: None,
        }
    }

    #[test]
    fn retention_keeps_all_active_and_caps_closed() {
        let mut positions = Vec::new();
        for i in 0..5 {
            positions.push(position(&format!("active-{i}"), PositionStatus::Active, i));
        }
        for i in 0..150 {
            positions.push(position(&format!("closed-{i}"), PositionStatus::Closed, i));
        }
        let retained = apply_retention(positions);
        let active_count = retained.iter().filter(|p| p.status == PositionStatus::Active).count();
        let closed_count = retained.iter().filter(|p| p.status == PositionStatus::Closed).count();
        assert_eq!(active_count, 5);
        assert_eq!(closed_count, MAX_RETAINED_CLOSED);
    }

    #[test]
    fn retention_keeps_newest_closed() {
        let positions = vec![
            position("old", PositionStatus::Closed, 1),
            position("new", PositionStatus::Closed, 2),
        ];
        let retained = apply_retention(positions);
        assert!(retained.iter().any(|p| p.id == "new"));
    }

    #[test]
    fn save_then_load_roundtrips_with_retention() {
        let dir = std::env::temp_dir().join(format!("bin-sentinel-store-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("positions.json");

        let store = PositionStore::new(&path);
        store.insert(position("p1", PositionStatus::Active, 1)).unwrap();
        store.insert(position("p2", PositionStatus::Closed, 2)).unwrap();

        let store2 = PositionStore::new(&path);
        store2.load().unwrap();
        assert!(store2.get("p1").is_some());
        assert!(store2.get("p2").is_some());
        assert_eq!(store2.active_by_timeframe(Timeframe::H1).unwrap().id, "p1");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
