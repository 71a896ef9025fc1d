//! Stale build removal

use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Keep the `retain` most recently modified builds of an environment and
/// delete the rest, together with their archives and markers. Builds named in
/// `protected` are never removed. Returns the removed build ids.
pub async fn remove_stale_builds(
    env_dir: &Dir,
    retain: usize,
    protected: &[&str],
) -> Result<Vec<String>, AgentError> {
    let mut builds: Vec<(SystemTime, String, PathBuf)> = Vec::new();
    for path in env_dir.list_dirs().await? {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        builds.push((modified, name, path));
    }
    builds.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let files = env_dir.list_files().await?;
    let mut removed = Vec::new();
    for (_, build_id, path) in builds.into_iter().skip(retain) {
        if protected.contains(&build_id.as_str()) {
            continue;
        }
        info!("Removing stale build {:?}", path);
        if let Err(e) = Dir::new(&path).delete().await {
            warn!("Unable to remove {:?}: {}", path, e);
            continue;
        }
        let prefix = format!("{}.", build_id);
        for file in files.iter().filter(|f| {
            f.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        }) {
            File::new(file).delete().await?;
        }
        removed.push(build_id);
    }
    Ok(removed)
}
