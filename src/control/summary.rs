use std::collections::BTreeMap;

use super::result_row::ControlStatus;

/// Per-status row counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub ok: u64,
    pub alarm: u64,
    pub info: u64,
    pub skip: u64,
    pub error: u64,
}

impl StatusSummary {
    pub fn passed_count(&self) -> u64 {
        self.ok + self.info
    }

    pub fn failed_count(&self) -> u64 {
        self.alarm + self.error
    }

    pub fn total_count(&self) -> u64 {
        self.ok + self.alarm + self.info + self.skip + self.error
    }

    pub fn record(&mut self, status: ControlStatus) {
        match status {
            ControlStatus::Ok => self.ok += 1,
            ControlStatus::Alarm => self.alarm += 1,
            ControlStatus::Info => self.info += 1,
            ControlStatus::Skip => self.skip += 1,
            ControlStatus::Error => self.error += 1,
        }
    }

    pub fn add(&mut self, other: &StatusSummary) {
        self.ok += other.ok;
        self.alarm += other.alarm;
        self.info += other.info;
        self.skip += other.skip;
        self.error += other.error;
    }
}

/// Group-level counters: overall status plus one summary per severity band.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSummary {
    pub status: StatusSummary,
    pub severity: BTreeMap<String, StatusSummary>,
}

impl GroupSummary {
    pub fn add_status(&mut self, summary: &StatusSummary) {
        self.status.add(summary);
    }

    pub fn add_severity(&mut self, severity: &str, summary: &StatusSummary) {
        self.severity
            .entry(severity.to_string())
            .or_default()
            .add(summary);
    }
}
