use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::procs::{
    derive_process_name, match_candidates, ProcessOps, ProcessRecord, SystemProcesses,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProcess {
    pub pid: u32,
    pub launch_path: String,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no launch path configured")]
    MissingLaunchPath,
    #[error("spawn failed: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    Terminated { pids: Vec<u32> },
    NoMatch,
}

impl CloseOutcome {
    pub fn is_terminated(&self) -> bool {
        matches!(self, CloseOutcome::Terminated { .. })
    }
}

pub trait AppSpawner: Send + Sync {
    fn spawn(&self, path: &str) -> io::Result<u32>;
}

pub struct CommandSpawner;

impl AppSpawner for CommandSpawner {
    fn spawn(&self, path: &str) -> io::Result<u32> {
        let mut child = Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let Some(pid) = child.id() else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "spawned process reported no pid",
            ));
        };
        // The child is never awaited inline; a detached task reaps it so the
        // app outlives whichever connection asked for it.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("launched process exited: pid={pid} status={status}"),
                Err(err) => debug!("launched process wait failed: pid={pid} err={err}"),
            }
        });
        Ok(pid)
    }
}

pub struct ProcessController {
    spawner: Arc<dyn AppSpawner>,
    procs: Arc<dyn ProcessOps>,
    tracked: StdMutex<HashMap<String, TrackedProcess>>,
    close_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessController {
    pub fn new(spawner: Arc<dyn AppSpawner>, procs: Arc<dyn ProcessOps>) -> Self {
        Self {
            spawner,
            procs,
            tracked: StdMutex::new(HashMap::new()),
            close_guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(CommandSpawner), Arc::new(SystemProcesses))
    }

    pub fn tracked_pid(&self, app_name: &str) -> Option<u32> {
        self.tracked
            .lock()
            .unwrap()
            .get(app_name)
            .map(|entry| entry.pid)
    }

    pub async fn launch(&self, app_name: &str, launch_path: &str) -> Result<u32, LaunchError> {
        let path = launch_path.trim();
        if path.is_empty() {
            return Err(LaunchError::MissingLaunchPath);
        }
        let pid = self.spawner.spawn(path)?;
        let replaced = self.tracked.lock().unwrap().insert(
            app_name.to_string(),
            TrackedProcess {
                pid,
                launch_path: path.to_string(),
            },
        );
        if let Some(prior) = replaced {
            warn!("relaunch of {app_name} drops tracking for pid {}", prior.pid);
        }
        info!("launched {app_name}: pid={pid} path={path}");
        Ok(pid)
    }

    pub async fn close(&self, app_name: &str, path_hint: &str) -> CloseOutcome {
        // One terminate sequence per app name at a time; other names proceed.
        let gate = self.close_guard(app_name).await;
        let held = gate.lock().await;

        let tracked = self.tracked.lock().unwrap().get(app_name).cloned();
        let outcome = match &tracked {
            Some(entry) => match self.terminate_by_pid(app_name, entry).await {
                Some(done) => done,
                None => self.terminate_by_name(app_name, Some(entry), path_hint).await,
            },
            None => self.terminate_by_name(app_name, None, path_hint).await,
        };

        // Tracking is dropped however the sequence ended, a fallback miss
        // included.
        self.tracked.lock().unwrap().remove(app_name);

        match &outcome {
            CloseOutcome::Terminated { pids } => {
                info!("closed {app_name}: terminated pids {pids:?}");
            }
            CloseOutcome::NoMatch => {
                warn!("close {app_name}: no matching process found");
            }
        }
        drop(held);
        self.release_close_guard(app_name, gate).await;
        outcome
    }

    async fn terminate_by_pid(
        &self,
        app_name: &str,
        entry: &TrackedProcess,
    ) -> Option<CloseOutcome> {
        let snapshot = self.snapshot().await;
        if !snapshot.iter().any(|record| record.pid == entry.pid) {
            debug!("tracked pid {} for {app_name} is gone", entry.pid);
            return None;
        }
        // Children are enumerated before the parent dies, while the parent
        // link still points at it.
        let children: Vec<u32> = snapshot
            .iter()
            .filter(|record| record.parent == Some(entry.pid))
            .map(|record| record.pid)
            .collect();
        if !self.kill(entry.pid).await {
            debug!("kill refused for tracked pid {} of {app_name}", entry.pid);
            return None;
        }
        let mut pids = vec![entry.pid];
        for child in children {
            if self.kill(child).await {
                pids.push(child);
            }
        }
        Some(CloseOutcome::Terminated { pids })
    }

    async fn terminate_by_name(
        &self,
        app_name: &str,
        tracked: Option<&TrackedProcess>,
        path_hint: &str,
    ) -> CloseOutcome {
        let recorded = tracked.map(|entry| entry.launch_path.as_str()).unwrap_or("");
        let source = if recorded.trim().is_empty() {
            path_hint
        } else {
            recorded
        };
        let Some(needle) = derive_process_name(source, app_name) else {
            return CloseOutcome::NoMatch;
        };
        debug!("close {app_name}: matching against {needle}");
        let snapshot = self.snapshot().await;
        let matches = match_candidates(&snapshot, &needle);
        if matches.is_empty() {
            return CloseOutcome::NoMatch;
        }
        let mut pids = Vec::new();
        for pid in matches {
            if self.kill(pid).await {
                pids.push(pid);
            }
        }
        if pids.is_empty() {
            CloseOutcome::NoMatch
        } else {
            CloseOutcome::Terminated { pids }
        }
    }

    async fn snapshot(&self) -> Vec<ProcessRecord> {
        let procs = self.procs.clone();
        match tokio::task::spawn_blocking(move || procs.snapshot()).await {
            Ok(records) => records,
            Err(err) => {
                warn!("process snapshot failed: {err}");
                Vec::new()
            }
        }
    }

    async fn kill(&self, pid: u32) -> bool {
        let procs = self.procs.clone();
        match tokio::task::spawn_blocking(move || procs.kill(pid)).await {
            Ok(done) => done,
            Err(err) => {
                warn!("process kill failed: pid={pid} err={err}");
                false
            }
        }
    }

    async fn close_guard(&self, app_name: &str) -> Arc<Mutex<()>> {
        let mut guards = self.close_guards.lock().await;
        guards.entry(app_name.to_string()).or_default().clone()
    }

    async fn release_close_guard(&self, app_name: &str, gate: Arc<Mutex<()>>) {
        drop(gate);
        let mut guards = self.close_guards.lock().await;
        // A clone held by a waiting close keeps the entry alive.
        if guards
            .get(app_name)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            guards.remove(app_name);
        }
    }
}
