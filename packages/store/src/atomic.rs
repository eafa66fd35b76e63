use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

/// Temp files older than this are removed at startup; anything younger may
/// belong to an in-flight write from another process start racing shutdown.
const TEMP_FILE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Result of the pre-rename guard: whether the write is still wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteGuardOutcome {
	Commit,
	Abort,
}

/// Writes `bytes` to `<path>.tmp.<uuid>` and renames it over `path`.
///
/// `guard` runs after the temp file is durable but before the rename; on
/// [`WriteGuardOutcome::Abort`] the temp file is unlinked and `Ok(false)` is
/// returned, leaving any previous file contents intact.
pub async fn write_atomic(
	path: &Path,
	bytes: Vec<u8>,
	guard: impl FnOnce() -> WriteGuardOutcome,
) -> Result<bool> {
	let file_name = path
		.file_name()
		.and_then(|n| n.to_str())
		.context("invalid target path")?;
	let tmp_path = path.with_file_name(format!("{file_name}.tmp.{}", Uuid::new_v4()));

	tokio::fs::write(&tmp_path, bytes)
		.await
		.with_context(|| format!("failed to write temp file: {}", tmp_path.display()))?;

	if guard() == WriteGuardOutcome::Abort {
		if let Err(err) = tokio::fs::remove_file(&tmp_path).await {
			tracing::warn!(path = %tmp_path.display(), ?err, "failed to remove aborted temp file");
		}
		return Ok(false);
	}

	tokio::fs::rename(&tmp_path, path)
		.await
		.with_context(|| format!("failed to commit write to: {}", path.display()))?;

	Ok(true)
}

/// Reads a file, mapping "not found" to `None`. Any other error is surfaced.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
	match tokio::fs::read(path).await {
		Ok(bytes) => Ok(Some(bytes)),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(err).with_context(|| format!("failed to read file: {}", path.display())),
	}
}

/// Removes abandoned `*.tmp.*` files left behind by a crash mid-write.
#[tracing::instrument(skip_all, fields(dir = %dir.display()))]
pub async fn cleanup_temp_files(dir: &Path) -> Result<()> {
	let mut entries = tokio::fs::read_dir(dir)
		.await
		.with_context(|| format!("failed to read dir: {}", dir.display()))?;

	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name();
		let Some(name) = name.to_str() else {
			continue;
		};
		if !name.contains(".tmp.") {
			continue;
		}

		let Ok(metadata) = entry.metadata().await else {
			continue;
		};
		let age = metadata
			.modified()
			.ok()
			.and_then(|modified| modified.elapsed().ok());
		let Some(age) = age else {
			continue;
		};

		if age > TEMP_FILE_MAX_AGE {
			tracing::info!(file = %entry.path().display(), "removing stale temp file");
			if let Err(err) = tokio::fs::remove_file(entry.path()).await {
				tracing::warn!(file = %entry.path().display(), ?err, "failed to remove stale temp file");
			}
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn aborted_write_leaves_previous_contents() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("record");

		assert!(
			write_atomic(&path, b"first".to_vec(), || WriteGuardOutcome::Commit)
				.await
				.unwrap()
		);
		assert!(
			!write_atomic(&path, b"second".to_vec(), || WriteGuardOutcome::Abort)
				.await
				.unwrap()
		);

		assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");

		// The aborted temp file must not linger.
		let mut entries = std::fs::read_dir(dir.path()).unwrap();
		assert!(entries.all(|e| e.unwrap().file_name() == "record"));
	}

	#[tokio::test]
	async fn read_optional_maps_missing_to_none() {
		let dir = tempfile::tempdir().unwrap();
		assert!(
			read_optional(&dir.path().join("missing"))
				.await
				.unwrap()
				.is_none()
		);
	}
}
