//! In-memory implementations of the storage seams, shared by the
//! integration test binaries, plus git fixture helpers.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use rephole::models::{
    JobPayload, JobRecord, JobState, MetaMap, ParentDocument, RepoState, SearchHit, VectorRecord,
};
use rephole::traits::{ActiveJob, Embedder, JobQueue, ParentStore, StateStore, VectorIndex};

// ============ State store ============

#[derive(Default)]
pub struct MemoryState {
    pub map: Mutex<HashMap<String, RepoState>>,
}

#[async_trait]
impl StateStore for MemoryState {
    async fn find_by_url(&self, repo_url: &str) -> Result<Option<RepoState>> {
        Ok(self.map.lock().unwrap().get(repo_url).cloned())
    }
    async fn save(&self, state: &RepoState) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(state.repo_url.clone(), state.clone());
        Ok(())
    }
}

// ============ Blob store ============

#[derive(Default)]
pub struct MemoryBlobs {
    pub map: Mutex<HashMap<(String, String), ParentDocument>>,
    pub saves: AtomicUsize,
}

#[async_trait]
impl ParentStore for MemoryBlobs {
    async fn save_parent(
        &self,
        id: &str,
        content: &str,
        repo_id: &str,
        meta: &MetaMap,
    ) -> Result<()> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.map.lock().unwrap().insert(
            (repo_id.to_string(), id.to_string()),
            ParentDocument {
                id: id.to_string(),
                repo_id: repo_id.to_string(),
                content: content.to_string(),
                metadata: meta.clone(),
            },
        );
        Ok(())
    }
    async fn get_parent(&self, id: &str, repo_id: &str) -> Result<Option<ParentDocument>> {
        Ok(self
            .map
            .lock()
            .unwrap()
            .get(&(repo_id.to_string(), id.to_string()))
            .cloned())
    }
    async fn get_parents(&self, ids: &[String], repo_id: &str) -> Result<Vec<ParentDocument>> {
        let map = self.map.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| map.get(&(repo_id.to_string(), id.clone())).cloned())
            .collect())
    }
}

// ============ Vector index ============

#[derive(Default)]
pub struct MemoryIndex {
    pub records: Mutex<HashMap<String, VectorRecord>>,
    pub upserts: AtomicUsize,
}

pub fn matches_filter(metadata: &MetaMap, filter: &MetaMap) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        let mut map = self.records.lock().unwrap();
        for record in records {
            map.insert(record.id.clone(), record);
        }
        Ok(())
    }
    async fn similarity_search(
        &self,
        _vector: &[f32],
        k: usize,
        filter: &MetaMap,
    ) -> Result<Vec<SearchHit>> {
        let map = self.records.lock().unwrap();
        let mut hits: Vec<&VectorRecord> = map
            .values()
            .filter(|r| matches_filter(&r.metadata, filter))
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits
            .into_iter()
            .take(k)
            .map(|r| SearchHit {
                id: r.id.clone(),
                content: r.content.clone(),
                score: 1.0,
                metadata: r.metadata.clone(),
            })
            .collect())
    }
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<SearchHit>> {
        let map = self.records.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| map.get(id))
            .map(|r| SearchHit {
                id: r.id.clone(),
                content: r.content.clone(),
                score: 0.0,
                metadata: r.metadata.clone(),
            })
            .collect())
    }
    async fn get_by_file_path(&self, repo_id: &str, path: &str) -> Result<Vec<SearchHit>> {
        let mut filter = MetaMap::new();
        filter.insert("repoId".into(), json!(repo_id));
        filter.insert("filePath".into(), json!(path));
        self.similarity_search(&[], usize::MAX, &filter).await
    }
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        let mut map = self.records.lock().unwrap();
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }
    async fn delete_by_filter(&self, filter: &MetaMap) -> Result<()> {
        let mut map = self.records.lock().unwrap();
        map.retain(|_, r| !matches_filter(&r.metadata, filter));
        Ok(())
    }
}

// ============ Embedder ============

#[derive(Default)]
pub struct CountingEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(texts
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| vec![t.len() as f32, 1.0, 2.0])
            .collect())
    }
}

// ============ Job queue ============

#[derive(Default)]
pub struct MemoryQueue {
    pub jobs: Mutex<Vec<JobRecord>>,
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.jobs.lock().unwrap().push(JobRecord {
            id,
            state: JobState::Waiting,
            progress: 0,
            payload,
            attempts_made: 0,
            failed_reason: None,
            queued_at: Utc::now(),
            finished_at: None,
        });
        Ok(id)
    }
    async fn dequeue(&self) -> Result<Option<ActiveJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.iter_mut().find(|j| j.state == JobState::Waiting) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts_made += 1;
        Ok(Some(ActiveJob {
            id: job.id,
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
        }))
    }
    async fn complete(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.state = JobState::Completed;
            job.progress = 100;
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }
    async fn fail(&self, id: Uuid, reason: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.failed_reason = Some(reason.to_string());
            job.state = if job.attempts_made >= 3 {
                job.finished_at = Some(Utc::now());
                JobState::Failed
            } else {
                JobState::Waiting
            };
        }
        Ok(())
    }
    async fn update_progress(&self, id: Uuid, progress: i32) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.progress = progress;
        }
        Ok(())
    }
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned())
    }
    async fn failed_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .cloned()
            .collect())
    }
    async fn retry(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs
            .iter_mut()
            .find(|j| j.id == id && j.state == JobState::Failed)
        {
            Some(job) => {
                job.state = JobState::Waiting;
                job.attempts_made = 0;
                job.failed_reason = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }
    async fn retry_all(&self) -> Result<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut count = 0;
        for job in jobs.iter_mut().filter(|j| j.state == JobState::Failed) {
            job.state = JobState::Waiting;
            job.attempts_made = 0;
            job.failed_reason = None;
            count += 1;
        }
        Ok(count)
    }
    async fn sweep(&self) -> Result<()> {
        Ok(())
    }
}

// ============ Git fixture helpers ============

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn run_git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

pub fn init_origin(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    run_git(dir, &["init", "-q", "-b", "main"]);
    run_git(dir, &["config", "user.email", "test@test.local"]);
    run_git(dir, &["config", "user.name", "Test"]);
}

pub fn commit_all(dir: &Path, msg: &str) {
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "-q", "-m", msg]);
}

pub fn write_file(dir: &Path, rel: &str, content: &[u8]) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
