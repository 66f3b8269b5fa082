//! Local durable copies of stage results under `<sessions>/<session>.artifacts/`.
//!
//! Side-effecting stages write what they are about to push here first, so the
//! computed result survives a rejected or gated-off mutation. Artifacts are
//! product output, independent of `RUST_LOG`. Writes use the same
//! temp-then-rename scheme and transient-I/O retry as the state store.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::backoff::RetryPolicy;
use crate::core::types::validate_id;
use crate::io::fs::{Filesystem, OsFilesystem};
use crate::retry::{Idempotency, RetryExecutor, is_transient_io};

#[derive(Debug, Clone)]
pub struct ArtifactStore<F = OsFilesystem> {
    dir: PathBuf,
    fs: F,
    retry: RetryExecutor,
}

impl ArtifactStore<OsFilesystem> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_filesystem(dir, OsFilesystem, RetryPolicy::state_store())
    }

    /// Artifact directory that sits next to the session's state file.
    pub fn for_session(sessions_dir: &Path, session_id: &str) -> Self {
        Self::new(sessions_dir.join(format!("{session_id}.artifacts")))
    }
}

impl<F: Filesystem> ArtifactStore<F> {
    pub fn with_filesystem(dir: impl Into<PathBuf>, fs: F, policy: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            fs,
            retry: RetryExecutor::new(policy),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Atomically write `value` as `<name>.json`.
    pub fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        validate_id("artifact name", name)?;
        let path = self.path(name);
        let mut buf = serde_json::to_string_pretty(value)
            .with_context(|| format!("serialize artifact {name}"))?;
        buf.push('\n');

        self.retry
            .run(
                "write artifact",
                Idempotency::Idempotent,
                |_| self.write_atomic(&path, buf.as_bytes()),
                is_transient_io,
            )
            .into_result()?;
        debug!(path = %path.display(), "artifact written");
        Ok(path)
    }

    /// Read `<name>.json`, or `None` if it was never written.
    pub fn read(&self, name: &str) -> Result<Option<Value>> {
        validate_id("artifact name", name)?;
        let path = self.path(name);
        let outcome = self.retry.run(
            "read artifact",
            Idempotency::Idempotent,
            |_| match self.fs.read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("read artifact {}", path.display())),
            },
            is_transient_io,
        );
        let Some(bytes) = outcome.into_result()? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse artifact {}", path.display()))?;
        Ok(Some(value))
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.fs
            .create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))?;
        let tmp_path = path.with_extension("json.tmp");
        self.fs
            .write_synced(&tmp_path, contents)
            .with_context(|| format!("write temp artifact {}", tmp_path.display()))?;
        self.fs
            .rename(&tmp_path, path)
            .with_context(|| format!("replace artifact {}", path.display()))?;
        Ok(())
    }
}
