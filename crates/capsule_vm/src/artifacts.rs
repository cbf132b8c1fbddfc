use crate::error::VmError;
use capsule_os::{CommandSpec, Executor};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::PathBuf;
use std::time::Duration;

const ARCHIVE_NAME: &str = ".capsule_bundle.tar.gz";
const UNPACK: &str = "mkdir -p \"$1\" && tar -xzf \"$2\" -C \"$1\" && rm -f \"$2\"";

/// Files shipped to a host before the run: the agent directory plus
/// generated files such as the task input.
#[derive(Debug, Default, Clone)]
pub struct ArtifactBundle {
    agent_dir: Option<PathBuf>,
    files: Vec<(String, Vec<u8>)>,
    /// Local files or directories placed at a path inside the bundle.
    staged: Vec<(String, PathBuf)>,
}

impl ArtifactBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agent_dir = Some(dir.into());
        self
    }

    pub fn add_file(&mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.push((name.into(), contents.into()));
    }

    pub fn stage(&mut self, dest: impl Into<String>, source: impl Into<PathBuf>) {
        self.staged.push((dest.into(), source.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.agent_dir.is_none() && self.files.is_empty() && self.staged.is_empty()
    }

    /// Gzipped tarball with paths relative to the destination directory.
    pub fn pack(&self) -> Result<Vec<u8>, VmError> {
        let io = |e: std::io::Error| VmError::Artifact(e.to_string());

        let mut tar = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        tar.follow_symlinks(false);
        if let Some(dir) = &self.agent_dir {
            if !dir.is_dir() {
                return Err(VmError::Artifact(format!(
                    "agent directory {} does not exist",
                    dir.display()
                )));
            }
            tar.append_dir_all(".", dir).map_err(io)?;
        }
        for (dest, source) in &self.staged {
            if source.is_dir() {
                tar.append_dir_all(dest, source).map_err(io)?;
            } else if source.is_file() {
                tar.append_path_with_name(source, dest).map_err(io)?;
            } else {
                tracing::warn!("Task file {} not found, not staged as {}", source.display(), dest);
            }
        }
        let mtime = chrono::Utc::now().timestamp().max(0) as u64;
        for (name, contents) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            header.set_cksum();
            tar.append_data(&mut header, name, contents.as_slice())
                .map_err(io)?;
        }
        let encoder = tar.into_inner().map_err(io)?;
        encoder.finish().map_err(io)
    }
}

/// Pack, upload and unpack the bundle into `dest` on the target.
/// Returns the archive size in bytes.
pub async fn upload_bundle(
    executor: &dyn Executor,
    bundle: &ArtifactBundle,
    dest: &str,
    timeout: Duration,
) -> Result<usize, VmError> {
    let bytes = bundle.pack()?;
    let archive = format!("{}/{}", dest.trim_end_matches('/'), ARCHIVE_NAME);

    let uploaded = executor.upload(&bytes, &archive, timeout).await?;
    if !uploaded.success() {
        return Err(VmError::Artifact(format!(
            "upload to {} failed: {}",
            archive,
            uploaded.error_excerpt(300)
        )));
    }
    let unpacked = executor
        .run(&CommandSpec::shell(UNPACK).arg(dest).arg(&archive), timeout)
        .await?;
    if !unpacked.success() {
        return Err(VmError::Artifact(format!(
            "unpacking into {} failed: {}",
            dest,
            unpacked.error_excerpt(300)
        )));
    }
    tracing::info!("Uploaded {} bytes of artifacts to {}", bytes.len(), dest);
    Ok(bytes.len())
}
