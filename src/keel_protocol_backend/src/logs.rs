use ic_canister_log::{declare_log_buffer, export};
use serde::Deserialize;
use std::str::FromStr;

// High-priority messages.
declare_log_buffer!(name = INFO, capacity = 1000);

// Low-priority info messages.
declare_log_buffer!(name = DEBUG, capacity = 1000);

// Oracle traffic.
declare_log_buffer!(name = TRACE_XRC, capacity = 1000);

#[derive(Clone, serde::Serialize, Deserialize, Debug, Copy)]
pub enum Priority {
    Info,
    TraceXrc,
    Debug,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Priority::Info),
            "trace_xrc" => Ok(Priority::TraceXrc),
            "debug" => Ok(Priority::Debug),
            _ => Err("could not recognize priority".to_string()),
        }
    }
}

#[derive(Clone, serde::Serialize, Deserialize, Debug)]
pub struct LogEntry {
    pub timestamp: u64,
    pub priority: Priority,
    pub file: String,
    pub line: u32,
    pub message: String,
    pub counter: u64,
}

#[derive(Clone, Default, serde::Serialize, Deserialize, Debug)]
pub struct Log {
    pub entries: Vec<LogEntry>,
}

impl Log {
    pub fn push_logs(&mut self, priority: Priority) {
        let logs = match priority {
            Priority::Info => export(&INFO),
            Priority::TraceXrc => export(&TRACE_XRC),
            Priority::Debug => export(&DEBUG),
        };
        for entry in logs {
            self.entries.push(LogEntry {
                timestamp: entry.timestamp,
                counter: entry.counter,
                priority,
                file: entry.file.to_string(),
                line: entry.line,
                message: entry.message,
            });
        }
    }

    pub fn push_all(&mut self) {
        self.push_logs(Priority::Info);
        self.push_logs(Priority::TraceXrc);
        self.push_logs(Priority::Debug);
    }

    pub fn sort_logs(&mut self) {
        self.entries.sort_by_key(|entry| entry.timestamp);
    }

    pub fn serialize_logs(&self, max_body_size: usize) -> String {
        let mut entries_json: String = serde_json::to_string(&self).unwrap_or_default();

        if entries_json.len() > max_body_size {
            let mut left = 0;
            let mut right = self.entries.len();

            while left < right {
                let mid = left + (right - left) / 2;
                let mut temp_log = self.clone();
                temp_log.entries.truncate(mid);
                let temp_json = serde_json::to_string(&temp_log).unwrap_or_default();

                if temp_json.len() <= max_body_size {
                    entries_json = temp_json;
                    left = mid + 1;
                } else {
                    right = mid;
                }
            }
        }
        entries_json
    }
}
