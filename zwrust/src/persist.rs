//! Network snapshot files
//!
//! One JSON document per network, `zwcfg_0x<home>.json`, in the configured
//! state directory. Writes go to a temporary file that is then renamed over
//! the old one.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use zwrust_types::NetworkSnapshot;

use crate::error::Result;

/// Path of the snapshot of `home_id` under `dir`
pub fn snapshot_path(dir: &Path, home_id: u32) -> PathBuf {
    dir.join(NetworkSnapshot::file_name(home_id))
}

/// Read the snapshot of `home_id`; `None` when there is none yet
pub async fn load(dir: &Path, home_id: u32) -> Result<Option<NetworkSnapshot>> {
    let path = snapshot_path(dir, home_id);
    let json = match fs::read_to_string(&path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No snapshot");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let snapshot = NetworkSnapshot::from_json(&json)?;
    info!(path = %path.display(), nodes = snapshot.nodes.len(), "Snapshot read");
    Ok(Some(snapshot))
}

/// Write `snapshot`, creating the directory if needed
pub async fn save(dir: &Path, snapshot: &NetworkSnapshot) -> Result<()> {
    fs::create_dir_all(dir).await?;
    let path = snapshot_path(dir, snapshot.home_id);
    let tmp = path.with_extension("json.tmp");

    fs::write(&tmp, snapshot.to_json()?).await?;
    fs::rename(&tmp, &path).await?;
    debug!(path = %path.display(), nodes = snapshot.nodes.len(), "Snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("zwrust-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = temp_dir("persist");
        let snapshot = NetworkSnapshot::new(0xDEAD_BEEF, 1);

        save(&dir, &snapshot).await.unwrap();
        assert!(snapshot_path(&dir, 0xDEAD_BEEF).ends_with("zwcfg_0xdeadbeef.json"));

        let loaded = load(&dir, 0xDEAD_BEEF).await.unwrap().unwrap();
        assert_eq!(loaded.home_id, 0xDEAD_BEEF);
        assert_eq!(loaded.controller_node_id, 1);

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let dir = temp_dir("missing");
        assert!(load(&dir, 0x0102_0304).await.unwrap().is_none());
    }
}
