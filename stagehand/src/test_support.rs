//! Scripted collaborators for unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::PipelineState;
use crate::io::artifacts::ArtifactStore;
use crate::io::generator::Generator;
use crate::io::mutation::{Change, MutationTarget};
use crate::io::state_store::{FileStateStore, StateStore};

type Responder = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Generator that replays canned responses and records every prompt.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, String>>>,
    responder: Option<Responder>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    /// Responses are consumed in order; `Err(msg)` entries become generator failures.
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            responder: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a script of successful responses.
    pub fn ok<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(responses.into_iter().map(|s| Ok(s.into())).collect())
    }

    /// Answer by inspecting the prompt; useful when calls run concurrently.
    pub fn respond_with(responder: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(responder)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts().len()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, prompt: &str, _timeout: Duration) -> Result<String> {
        self.prompts
            .lock()
            .map_err(|_| anyhow!("prompt log poisoned"))?
            .push(prompt.to_string());
        if let Some(responder) = &self.responder {
            return responder(prompt);
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("script poisoned"))?
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("scripted generator has no responses left")),
        }
    }
}

/// Mutation target that records accepted changes and can reject on demand.
#[derive(Default)]
pub struct RecordingTarget {
    applied: Mutex<Vec<Change>>,
    reject: Option<String>,
}

impl RecordingTarget {
    pub fn rejecting(reason: &str) -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            reject: Some(reason.to_string()),
        }
    }

    pub fn applied(&self) -> Vec<Change> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl MutationTarget for RecordingTarget {
    fn apply(&self, change: &Change) -> Result<()> {
        if let Some(reason) = &self.reject {
            return Err(crate::errors::MutationRejected {
                change: change.label(),
                reason: reason.clone(),
            }
            .into());
        }
        self.applied
            .lock()
            .map_err(|_| anyhow!("recording target poisoned"))?
            .push(change.clone());
        Ok(())
    }
}

/// In-memory [`StateStore`] that counts saves.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<BTreeMap<String, PipelineState>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, session_id: &str) -> Option<PipelineState> {
        self.states.lock().ok()?.get(session_id).cloned()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, session_id: &str) -> Result<Option<PipelineState>> {
        Ok(self.get(session_id))
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        self.states
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?
            .insert(state.session_id.clone(), state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wraps a store and counts successful saves.
pub struct CountingStore<S> {
    inner: S,
    saves: AtomicUsize,
}

impl<S: StateStore> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl<S: StateStore> StateStore for CountingStore<S> {
    fn load(&self, session_id: &str) -> Result<Option<PipelineState>> {
        self.inner.load(session_id)
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        self.inner.save(state)?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Temporary sessions directory with file-backed stores.
pub struct TestSessions {
    temp: TempDir,
}

impl TestSessions {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir()?,
        })
    }

    pub fn dir(&self) -> &Path {
        self.temp.path()
    }

    pub fn store(&self) -> FileStateStore {
        FileStateStore::new(self.dir())
    }

    pub fn artifacts(&self, session_id: &str) -> ArtifactStore {
        ArtifactStore::for_session(self.dir(), session_id)
    }

    /// State as it is on disk, bypassing any in-memory pipeline.
    pub fn persisted(&self, session_id: &str) -> Result<Option<PipelineState>> {
        self.store().load(session_id)
    }
}
