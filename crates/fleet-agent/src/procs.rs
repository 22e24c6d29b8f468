use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
}

pub trait ProcessOps: Send + Sync {
    fn snapshot(&self) -> Vec<ProcessRecord>;
    fn kill(&self, pid: u32) -> bool;
}

pub struct SystemProcesses;

impl ProcessOps for SystemProcesses {
    fn snapshot(&self) -> Vec<ProcessRecord> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessRecord {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect()
    }

    fn kill(&self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::new(),
        );
        match system.process(target) {
            Some(process) => process.kill(),
            None => false,
        }
    }
}

// Launch paths use whichever separator the coordinator sent, so both kinds
// are treated as segment boundaries.
pub fn derive_process_name(launch_path: &str, display_name: &str) -> Option<String> {
    let path = launch_path.trim();
    if !path.is_empty() {
        let segment = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let stem = match segment.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => segment,
        };
        if !stem.is_empty() {
            return Some(stem.to_lowercase());
        }
    }
    display_name
        .split_whitespace()
        .next()
        .map(|token| token.to_lowercase())
}

pub fn match_candidates(snapshot: &[ProcessRecord], needle: &str) -> Vec<u32> {
    let needle = needle.to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let exact: Vec<u32> = snapshot
        .iter()
        .filter(|record| stem_of(&record.name) == needle)
        .map(|record| record.pid)
        .collect();
    if !exact.is_empty() {
        return exact;
    }
    snapshot
        .iter()
        .filter(|record| record.name.to_lowercase().contains(&needle))
        .map(|record| record.pid)
        .collect()
}

// Process tables carry the executable extension on some platforms and not on
// others; exact matching compares stems so one derived name covers both.
fn stem_of(name: &str) -> String {
    let lowered = name.to_lowercase();
    match lowered.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => lowered,
    }
}
