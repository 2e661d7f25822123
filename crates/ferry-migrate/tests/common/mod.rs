//! Common test utilities for ferry-migrate
//!
//! In-memory source and remote stores that record every call and can be
//! told to fail, plus a scripted confirmer and a config builder that keeps
//! all state inside a temporary directory.

#![allow(dead_code)]

use async_trait::async_trait;
use camino::Utf8PathBuf;
use ferry_core::types::{
    CompressionFormat, FerryConfig, RetryPoliciesConfig, RetryPolicy, RetryStrategy,
};
use ferry_core::{CancellationToken, Error, Result};
use ferry_migrate::deletion::Confirmer;
use ferry_migrate::store::{ByteStream, ObjectEntry, RemoteStore, SourceStore, Unit};
use ferry_migrate::{
    MigrationOptions, MigrationOrchestrator, ProgressStore, RemoteLayout, RunSummary,
    TransferDownloader, VerificationEngine,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

/// Remote root used by [`test_config`]
pub const REMOTE_ROOT: &str = "/ferry-test";

/// Deterministic, poorly compressible content
pub fn content(seed: u8, len: usize) -> Vec<u8> {
    let mut state = seed as u32 * 7919 + 17;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        strategy: RetryStrategy::FixedDelay,
        backoff_multiplier: 1.0,
        initial_delay_ms: 1,
        max_delay_ms: 2,
    }
}

/// Config with every path under `root`, plain tar parts of 4 KiB and
/// millisecond retries
pub fn test_config(root: &Path) -> FerryConfig {
    let utf8 = |p: &Path| Utf8PathBuf::from_path_buf(p.to_path_buf()).unwrap();

    let mut config = FerryConfig::default();
    config.workspace.scratch_dir = utf8(&root.join("scratch"));
    config.workspace.progress_file = utf8(&root.join("state").join("progress.json"));
    config.workspace.reports_dir = utf8(&root.join("state").join("reports"));
    config.archive.split_threshold_bytes = 4096;
    config.archive.compression = CompressionFormat::Tar;
    config.archive.compression_level = 0;
    config.concurrency.unit_workers = 2;
    config.concurrency.download_workers = 2;
    config.retry_policies = RetryPoliciesConfig {
        default: fast_policy(),
        operations: Default::default(),
    };
    config.remote.root = REMOTE_ROOT.to_string();
    config
}

#[derive(Default)]
struct SourceState {
    units: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    failing_objects: HashSet<(String, String)>,
    failing_deletes: HashSet<String>,
    get_calls: Vec<(String, String)>,
    list_object_calls: usize,
    deleted: Vec<String>,
}

/// In-memory source store
#[derive(Clone, Default)]
pub struct MemorySourceStore {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit holding `objects`
    pub fn add_unit(&self, unit_id: &str, objects: &[(&str, Vec<u8>)]) {
        let objects = objects
            .iter()
            .map(|(path, data)| (path.to_string(), data.clone()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .units
            .insert(unit_id.to_string(), objects);
    }

    /// Every read of this object fails permanently
    pub fn fail_object(&self, unit_id: &str, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_objects
            .insert((unit_id.to_string(), path.to_string()));
    }

    /// Every delete of this unit fails permanently
    pub fn fail_delete(&self, unit_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deletes
            .insert(unit_id.to_string());
    }

    /// Clear every injected failure
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_objects.clear();
        state.failing_deletes.clear();
    }

    pub fn get_count(&self) -> usize {
        self.state.lock().unwrap().get_calls.len()
    }

    pub fn get_count_for(&self, unit_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .get_calls
            .iter()
            .filter(|(u, _)| u == unit_id)
            .count()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn has_unit(&self, unit_id: &str) -> bool {
        self.state.lock().unwrap().units.contains_key(unit_id)
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    fn name(&self) -> &str {
        "memory-source"
    }

    async fn list_units(&self) -> Result<Vec<Unit>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .units
            .iter()
            .map(|(id, objects)| Unit {
                id: id.clone(),
                region: "test".into(),
                size_bytes: objects.values().map(|d| d.len() as u64).sum(),
                object_count: objects.len() as u64,
                created_at: None,
            })
            .collect())
    }

    async fn list_objects(&self, unit_id: &str) -> Result<Vec<ObjectEntry>> {
        let mut state = self.state.lock().unwrap();
        state.list_object_calls += 1;
        let objects = state
            .units
            .get(unit_id)
            .ok_or_else(|| Error::not_found(format!("unit {}", unit_id)))?;
        Ok(objects
            .iter()
            .map(|(path, data)| ObjectEntry {
                path: path.clone(),
                size: data.len() as u64,
                last_modified: None,
            })
            .collect())
    }

    async fn get_object(&self, unit_id: &str, path: &str) -> Result<ByteStream> {
        let mut state = self.state.lock().unwrap();
        state
            .get_calls
            .push((unit_id.to_string(), path.to_string()));
        if state
            .failing_objects
            .contains(&(unit_id.to_string(), path.to_string()))
        {
            return Err(Error::store("get object", format!("{}/{} is unreadable", unit_id, path)));
        }
        let data = state
            .units
            .get(unit_id)
            .and_then(|objects| objects.get(path))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{}/{}", unit_id, path)))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete_unit(&self, unit_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(unit_id) {
            return Err(Error::store("delete unit", format!("{} is locked", unit_id)));
        }
        state.units.remove(unit_id);
        state.deleted.push(unit_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RemoteState {
    files: BTreeMap<String, Vec<u8>>,
    puts: Vec<String>,
    gets: Vec<String>,
    interrupt_put: Option<CancellationToken>,
    free_space: Option<u64>,
}

/// In-memory remote store
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` and fail on the next upload
    pub fn interrupt_next_put(&self, token: CancellationToken) {
        self.state.lock().unwrap().interrupt_put = Some(token);
    }

    pub fn set_free_space(&self, bytes: u64) {
        self.state.lock().unwrap().free_space = Some(bytes);
    }

    pub fn put_count(&self) -> usize {
        self.state.lock().unwrap().puts.len()
    }

    pub fn puts(&self) -> Vec<String> {
        self.state.lock().unwrap().puts.clone()
    }

    pub fn get_count(&self) -> usize {
        self.state.lock().unwrap().gets.len()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn insert_file(&self, path: &str, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data);
    }

    /// Flip one byte of a stored file
    pub fn tamper(&self, path: &str, offset: usize) {
        let mut state = self.state.lock().unwrap();
        let data = state.files.get_mut(path).expect("file to tamper with");
        data[offset] ^= 0xff;
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory-remote"
    }

    async fn put_file(&self, path: &str, mut body: ByteStream) -> Result<()> {
        if let Some(token) = self.state.lock().unwrap().interrupt_put.take() {
            token.cancel();
            return Err(Error::Cancelled);
        }
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        let mut state = self.state.lock().unwrap();
        state.puts.push(path.to_string());
        state.files.insert(path.to_string(), data);
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .state
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|p| p.starts_with(&dir))
            .cloned()
            .collect())
    }

    async fn get_file(&self, path: &str) -> Result<ByteStream> {
        let mut state = self.state.lock().unwrap();
        state.gets.push(path.to_string());
        let data = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(path.to_string()))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn free_space_bytes(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().free_space.unwrap_or(u64::MAX / 2))
    }
}

/// Confirmer answering from a fixed script
pub struct ScriptedConfirmer {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Progress store at the config's progress file
pub fn load_progress(config: &FerryConfig) -> Arc<ProgressStore> {
    Arc::new(ProgressStore::load(config.workspace.progress_file.as_std_path()).unwrap())
}

/// Migrate every source unit, returning the progress store and summary
pub async fn migrate_all(
    config: &FerryConfig,
    source: &MemorySourceStore,
    remote: &MemoryRemoteStore,
) -> (Arc<ProgressStore>, RunSummary) {
    let progress = load_progress(config);
    let summary = MigrationOrchestrator::new(
        config,
        Arc::new(source.clone()),
        Arc::new(remote.clone()),
        progress.clone(),
    )
    .with_progress(false)
    .run(&MigrationOptions::default())
    .await
    .unwrap();
    (progress, summary)
}

/// Verification engine over the in-memory stores
pub fn verification_engine(
    config: &FerryConfig,
    source: &MemorySourceStore,
    remote: &MemoryRemoteStore,
    progress: Arc<ProgressStore>,
) -> VerificationEngine {
    let downloader = TransferDownloader::new(
        Arc::new(remote.clone()),
        RemoteLayout::new(config.remote.root.clone()),
        fast_policy(),
    );
    VerificationEngine::new(
        Arc::new(source.clone()),
        downloader,
        progress,
        config.workspace.scratch_dir.as_std_path(),
        fast_policy(),
    )
}

/// Remote path of a unit's file
pub fn remote_path(unit_id: &str, name: &str) -> String {
    format!("{}/{}/{}", REMOTE_ROOT, unit_id, name)
}
