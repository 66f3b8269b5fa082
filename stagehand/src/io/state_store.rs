//! Durable pipeline state, one JSON document per session.
//!
//! Writes go to `<session>.json.tmp` and are renamed over `<session>.json`, so
//! a crash mid-write leaves either the previous checkpoint or the new one,
//! never a torn file. Transient I/O failures are retried with backoff; a write
//! that still fails is returned to the caller.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::backoff::RetryPolicy;
use crate::core::types::{PipelineState, validate_id};
use crate::io::fs::{Filesystem, OsFilesystem};
use crate::retry::{Idempotency, RetryExecutor, is_transient_io};

/// Load/save contract for pipeline state.
pub trait StateStore {
    /// Returns `Ok(None)` when the session has never checkpointed.
    fn load(&self, session_id: &str) -> Result<Option<PipelineState>>;
    fn save(&self, state: &PipelineState) -> Result<()>;
}

impl<T: StateStore + ?Sized> StateStore for &T {
    fn load(&self, session_id: &str) -> Result<Option<PipelineState>> {
        (**self).load(session_id)
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        (**self).save(state)
    }
}

/// State store writing `<dir>/<session_id>.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore<F = OsFilesystem> {
    dir: PathBuf,
    fs: F,
    retry: RetryExecutor,
}

impl FileStateStore<OsFilesystem> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_filesystem(dir, OsFilesystem, RetryPolicy::state_store())
    }
}

impl<F: Filesystem> FileStateStore<F> {
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

    pub fn state_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.fs
            .create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let tmp_path = path.with_extension("json.tmp");
        self.fs
            .write_synced(&tmp_path, contents)
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        self.fs
            .rename(&tmp_path, path)
            .with_context(|| format!("replace state {}", path.display()))?;
        Ok(())
    }
}

impl<F: Filesystem> StateStore for FileStateStore<F> {
    fn load(&self, session_id: &str) -> Result<Option<PipelineState>> {
        validate_id("session id", session_id)?;
        let path = self.state_path(session_id);
        debug!(path = %path.display(), "loading pipeline state");

        let outcome = self.retry.run(
            "read pipeline state",
            Idempotency::Idempotent,
            |_| match self.fs.read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("read state {}", path.display())),
            },
            is_transient_io,
        );
        let Some(bytes) = outcome.into_result()? else {
            debug!(session_id, "no prior state");
            return Ok(None);
        };

        let state: PipelineState = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse state {}", path.display()))?;
        debug!(stage = %state.stage, iteration = state.iteration, "pipeline state loaded");
        Ok(Some(state))
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        validate_id("session id", &state.session_id)?;
        let path = self.state_path(&state.session_id);
        debug!(path = %path.display(), stage = %state.stage, iteration = state.iteration, "writing pipeline state");

        let mut buf = serde_json::to_string_pretty(state).context("serialize pipeline state")?;
        buf.push('\n');
        self.retry
            .run(
                "write pipeline state",
                Idempotency::Idempotent,
                |_| self.write_atomic(&path, buf.as_bytes()),
                is_transient_io,
            )
            .into_result()
    }
}
