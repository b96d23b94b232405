//! Process metrics collection through the OS `ps` tool.
//!
//! The spawner uses this to verify that a PID reported by the
//! preloader actually belongs to a process running as the expected
//! user. `ps` is deliberately used instead of /proc parsing so the
//! check works identically across the supported Unixes.

use std::collections::HashMap;
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMetrics {
    pub pid: i32,
    pub uid: u32,
}

#[derive(Error, Debug)]
pub enum MetricsError {
    /// Running or capturing `ps` failed.
    #[error("error capturing 'ps' output: {0}")]
    System(String),
    /// `ps` produced output we cannot understand.
    #[error("error parsing 'ps' output: {0}")]
    Parse(String),
}

#[derive(Debug, Default)]
pub struct ProcessMetricsCollector;

impl ProcessMetricsCollector {
    pub fn new() -> Self {
        ProcessMetricsCollector
    }

    /// Queries pid and uid for the given processes. PIDs that no
    /// longer exist are simply absent from the result map.
    pub fn collect(&self, pids: &[i32]) -> Result<HashMap<i32, ProcessMetrics>, MetricsError> {
        let pid_list = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let output = Command::new("ps")
            .args(["-o", "pid=,uid=", "-p", &pid_list])
            .output()
            .map_err(|e| MetricsError::System(e.to_string()))?;

        // ps exits nonzero when none of the requested PIDs exist; that
        // is not an error here, it just yields an empty map.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut result = HashMap::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let pid = fields
                .next()
                .and_then(|f| f.parse::<i32>().ok())
                .ok_or_else(|| MetricsError::Parse(format!("bad pid field in line '{line}'")))?;
            let uid = fields
                .next()
                .and_then(|f| f.parse::<u32>().ok())
                .ok_or_else(|| MetricsError::Parse(format!("bad uid field in line '{line}'")))?;
            result.insert(pid, ProcessMetrics { pid, uid });
        }
        Ok(result)
    }

    /// Convenience wrapper for a single process.
    pub fn uid_of(&self, pid: i32) -> Result<Option<u32>, MetricsError> {
        Ok(self.collect(&[pid])?.get(&pid).map(|m| m.uid))
    }
}
