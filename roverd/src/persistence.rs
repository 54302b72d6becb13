//! # persistence
//!
//! Map snapshot files. `stop_map` serialises the whole mapper state (grid
//! cells, trail, counters, raw-reading log) into a timestamped JSON file
//! under the data directory; nothing is loaded back at runtime, the files
//! exist for offline analysis and regression datasets.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use tokio::fs;
use tracing::info;

use crate::mapper::MapSnapshot;

/// Write `snapshot` to `<dir>/map_YYYYMMDD_HHmmss.json` and return the path.
pub async fn save_map_snapshot(snapshot: &MapSnapshot, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let name = format!("map_{}.json", Local::now().format("%Y%m%d_%H%M%S"));
    let path = dir.join(name);
    let json = serde_json::to_string_pretty(snapshot)?;
    fs::write(&path, json).await?;
    info!(
        "map snapshot saved to {} ({} occupied / {} free cells)",
        path.display(),
        snapshot.grid.occupied.len(),
        snapshot.grid.free.len()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::Mapper;
    use rover_types::Pose;

    #[tokio::test]
    async fn snapshot_file_round_trips() {
        let mut mapper = Mapper::new();
        mapper.on_pose(Pose::on_ground(1_000_000_000, 0.0, 0.0, 0.0));
        mapper.on_range_cm(30);

        let dir = std::env::temp_dir().join(format!("roverd-snap-{}", std::process::id()));
        let path = save_map_snapshot(&mapper.snapshot(), &dir).await.unwrap();

        let text = fs::read_to_string(&path).await.unwrap();
        let back: MapSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back.updates, 1);
        assert_eq!(back.grid.occupied, vec![[3, 0]]);
        assert!((back.grid.cell_size - 0.10).abs() < 1e-12);

        let _ = fs::remove_dir_all(&dir).await;
    }
}
