//! Materializing step implementations on the host

use flate2::read::GzDecoder;
use sluice_client::RegistryClient;
use sluice_core::step::StepId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::StepError;
use crate::layout::Layout;

/// Script sourced to run a step
pub const RUN_SCRIPT: &str = "run.sh";

/// Optional script sourced before `run.sh`, in the main shell
pub const INIT_SCRIPT: &str = "init.sh";

/// Writes inline script code as the step's `run.sh`
pub(crate) async fn write_script(dest: &Path, code: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    tokio::fs::write(dest.join(RUN_SCRIPT), code).await
}

/// Recursively copies `src` into `dest`
///
/// Directories containing `dest` are skipped, so a workspace nested in the
/// copied tree is not copied into itself.
pub(crate) async fn copy_dir(src: &Path, dest: &Path) -> Result<(), StepError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&dest)?;
        let skip = fs::canonicalize(&dest)?;
        copy_dir_blocking(&src, &dest, &skip)
    })
    .await??;
    Ok(())
}

fn copy_dir_blocking(src: &Path, dest: &Path, skip: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        // Follows symlinks
        if fs::metadata(&path)?.is_dir() {
            if skip.starts_with(fs::canonicalize(&path)?) {
                debug!("Not copying {} into itself", path.display());
                continue;
            }
            copy_dir_blocking(&path, &target, skip)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

/// Returns the cached directory of a registry step, downloading it first if needed
///
/// The cache is keyed by `owner-name[@version]`, so fetching the same step
/// twice only downloads it once.
pub(crate) async fn fetch_registry_step(
    id: &StepId,
    layout: &Layout,
    registry: Option<&RegistryClient>,
) -> Result<PathBuf, StepError> {
    let cache_root = layout.step_cache_dir();
    let key = id.cache_key();
    let cached = cache_root.join(&key);

    if cached.is_dir() {
        debug!("Using cached step {} from {}", id, cached.display());
        return Ok(cached);
    }

    let registry = registry.ok_or_else(|| StepError::NoRegistry(id.to_string()))?;
    tokio::fs::create_dir_all(&cache_root).await?;

    let tarball = cache_root.join(format!("{}.tar.gz", key));
    let staging = cache_root.join(format!("{}.partial", key));

    registry
        .download_step(&id.owner, &id.name, id.version.as_deref(), &tarball)
        .await
        .map_err(|source| StepError::Download {
            step: id.to_string(),
            source,
        })?;

    let (from, to) = (tarball.clone(), staging.clone());
    tokio::task::spawn_blocking(move || unpack_step(&from, &to)).await??;
    tokio::fs::rename(&staging, &cached).await?;
    let _ = tokio::fs::remove_file(&tarball).await;

    info!("Fetched step {}", id);
    Ok(cached)
}

/// Unpacks a gzipped step tarball into `dest`, replacing what was there
pub(crate) fn unpack_step(tarball: &Path, dest: &Path) -> io::Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    let file = fs::File::open(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.unpack(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use sluice_core::pipeline::PipelineKind;

    fn write_step_tarball(path: &Path) {
        let encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in [("run.sh", "echo lint"), ("step.json", r#"{"name": "lint"}"#)] {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_unpack_step() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join("lint.tar.gz");
        write_step_tarball(&tarball);

        let dest = dir.path().join("lint");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale"), "old").unwrap();

        unpack_step(&tarball, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("run.sh")).unwrap(), "echo lint");
        assert!(dest.join("step.json").exists());
        assert!(!dest.join("stale").exists());
    }

    #[tokio::test]
    async fn test_copy_dir_nested() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("lib/util")).unwrap();
        fs::write(src.join("run.sh"), "make").unwrap();
        fs::write(src.join("lib/util/helpers.sh"), "true").unwrap();

        let dest = dir.path().join("dest");
        copy_dir(&src, &dest).await.unwrap();

        assert_eq!(fs::read_to_string(dest.join("run.sh")).unwrap(), "make");
        assert!(dest.join("lib/util/helpers.sh").exists());
    }

    #[tokio::test]
    async fn test_copy_dir_skips_nested_destination() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.go"), "package main").unwrap();
        let dest = dir.path().join(".sluice/builds/1/source");

        copy_dir(dir.path(), &dest).await.unwrap();

        assert!(dest.join("main.go").exists());
        assert!(!dest.join(".sluice").exists());
    }

    #[tokio::test]
    async fn test_registry_step_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), PipelineKind::Build, "1", "app", "/pipeline", dir.path().join("cache"));
        let id = StepId::parse("acme/lint@1.0.0").unwrap();

        let cached = layout.step_cache_dir().join("acme-lint@1.0.0");
        fs::create_dir_all(&cached).unwrap();
        fs::write(cached.join("run.sh"), "lint").unwrap();

        // No registry: only the cache can satisfy the fetch
        let path = fetch_registry_step(&id, &layout, None).await.unwrap();
        assert_eq!(path, cached);
    }

    #[tokio::test]
    async fn test_registry_step_without_registry() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), PipelineKind::Build, "1", "app", "/pipeline", dir.path().join("cache"));
        let id = StepId::parse("acme/lint").unwrap();

        let err = fetch_registry_step(&id, &layout, None).await.unwrap_err();
        assert!(matches!(err, StepError::NoRegistry(_)));
    }
}
