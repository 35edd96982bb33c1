//! Pipeline filesystem layout
//!
//! Every run gets a host directory `<working_dir>/<kind>s/<run_id>` that is
//! bind-mounted into the container at [`MNT_ROOT`]. Steps and sources are
//! staged there on the host and copied into the guest root from inside the
//! container.

use sluice_core::pipeline::PipelineKind;
use std::path::{Path, PathBuf};

use crate::artifact::Artifact;

/// Where the host run directory is mounted inside the container
pub const MNT_ROOT: &str = "/mnt";

/// Guest directory collected into the host cache at the end of a run
pub const GUEST_CACHE_DIR: &str = "/cache";

const TAR_CONTENT_TYPE: &str = "application/x-tar";

#[derive(Debug, Clone)]
pub struct Layout {
    kind: PipelineKind,
    run_id: String,
    application_id: String,
    host_root: PathBuf,
    guest_root: String,
    cache_dir: PathBuf,
}

impl Layout {
    pub fn new(
        working_dir: &Path,
        kind: PipelineKind,
        run_id: impl Into<String>,
        application_id: impl Into<String>,
        guest_root: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        let run_id = run_id.into();
        let guest_root = guest_root.into().trim_end_matches('/').to_string();
        Self {
            host_root: working_dir.join(format!("{}s", kind)).join(&run_id),
            kind,
            run_id,
            application_id: application_id.into(),
            guest_root,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn host_source_dir(&self) -> PathBuf {
        self.host_root.join("source")
    }

    pub fn host_output_dir(&self) -> PathBuf {
        self.host_root.join("output")
    }

    pub fn host_step_dir(&self, safe_id: &str) -> PathBuf {
        self.host_root.join("steps").join(safe_id)
    }

    pub fn host_artifacts_dir(&self) -> PathBuf {
        self.host_root.join("artifacts")
    }

    /// Staging copy of the cache, mounted into the guest
    pub fn host_cache_stage(&self) -> PathBuf {
        self.host_root.join("cache")
    }

    /// Where the guest cache directory is kept between runs
    pub fn guest_cache_store(&self) -> PathBuf {
        self.cache_dir.join("guest")
    }

    /// Registry steps are cached here by `owner-name[@version]`
    pub fn step_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("steps")
    }

    pub fn mnt_source_dir(&self) -> String {
        format!("{}/source", MNT_ROOT)
    }

    pub fn mnt_cache_dir(&self) -> String {
        format!("{}/cache", MNT_ROOT)
    }

    pub fn mnt_step_dir(&self, safe_id: &str) -> String {
        format!("{}/steps/{}", MNT_ROOT, safe_id)
    }

    pub fn guest_root(&self) -> &str {
        &self.guest_root
    }

    pub fn guest_source_dir(&self) -> String {
        format!("{}/source", self.guest_root)
    }

    pub fn guest_output_dir(&self) -> String {
        format!("{}/output", self.guest_root)
    }

    pub fn guest_report_dir(&self) -> String {
        format!("{}/report", self.guest_root)
    }

    pub fn guest_steps_dir(&self) -> String {
        format!("{}/steps", self.guest_root)
    }

    pub fn guest_step_dir(&self, safe_id: &str) -> String {
        format!("{}/{}", self.guest_steps_dir(), safe_id)
    }

    pub fn guest_step_report_dir(&self, safe_id: &str) -> String {
        format!("{}/{}", self.guest_report_dir(), safe_id)
    }

    /// Artifact for `guest_path`, written to `<host_dir>.tar` and extracted to `host_dir`
    pub fn artifact(
        &self,
        container_id: &str,
        guest_path: &str,
        host_dir: PathBuf,
        tar_name: &str,
        step_id: &str,
    ) -> Artifact {
        let host_tar_path = match host_dir.parent() {
            Some(parent) => parent.join(tar_name),
            None => PathBuf::from(tar_name),
        };
        Artifact {
            container_id: container_id.to_string(),
            guest_path: guest_path.to_string(),
            host_tar_path,
            host_dir,
            application_id: self.application_id.clone(),
            kind: self.kind,
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            content_type: TAR_CONTENT_TYPE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new(
            Path::new("/var/lib/sluice"),
            PipelineKind::Deploy,
            "17",
            "app",
            "/pipeline/",
            "/var/cache/sluice",
        );

        assert_eq!(layout.host_root(), Path::new("/var/lib/sluice/deploys/17"));
        assert_eq!(layout.host_step_dir("lint-1"), Path::new("/var/lib/sluice/deploys/17/steps/lint-1"));
        assert_eq!(layout.mnt_step_dir("lint-1"), "/mnt/steps/lint-1");
        assert_eq!(layout.guest_step_dir("lint-1"), "/pipeline/steps/lint-1");
        assert_eq!(layout.guest_step_report_dir("lint-1"), "/pipeline/report/lint-1");
        assert_eq!(layout.step_cache_dir(), Path::new("/var/cache/sluice/steps"));
        assert_eq!(layout.guest_cache_store(), Path::new("/var/cache/sluice/guest"));
    }

    #[test]
    fn test_artifact_paths() {
        let layout = Layout::new(Path::new("/w"), PipelineKind::Build, "3", "app", "/pipeline", "/c");
        let artifact = layout.artifact("ctr", "/pipeline/output", layout.host_output_dir(), "output.tar", "store");

        assert_eq!(artifact.host_tar_path, Path::new("/w/builds/3/output.tar"));
        assert_eq!(artifact.host_dir, Path::new("/w/builds/3/output"));
        assert_eq!(artifact.remote_key(), "project-artifacts/app/build/3/step/store/output.tar");
    }
}
