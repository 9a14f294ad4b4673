use backlot::{Job, JobState, QueueStats};
use chrono::{DateTime, Utc};
use comfy_table::Table;
use std::fmt;

pub fn state_icon(state: JobState) -> &'static str {
    match state {
        JobState::Scheduled => "🕒",
        JobState::Enqueued => "🟡",
        JobState::Leased => "🔵",
        JobState::Succeeded => "🟢",
        JobState::Failed => "🔴",
        JobState::Dead => "💀",
    }
}

pub struct JobTable {
    table: Table,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.set_header(vec![
            "ID", "Queue", "Type", "State", "Attempts", "Created At", "Due At",
        ]);
        Self { table }
    }

    pub fn add_job(&mut self, job: &Job) {
        let id = job.id.to_string();
        self.table.add_row(vec![
            id[..8].to_string(),
            job.queue_name.clone(),
            job.payload.job_type.clone(),
            format!("{} {}", state_icon(job.state), job.state),
            job.attempts.to_string(),
            format_time(job.created_at),
            format_time(job.due_at),
        ]);
    }

    pub fn len(&self) -> usize {
        self.table.row_iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

pub struct StatsTable {
    table: Table,
}

impl Default for StatsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        let mut header = vec!["Queue".to_string()];
        header.extend(
            JobState::ALL
                .iter()
                .map(|state| format!("{} {}", state_icon(*state), state)),
        );
        header.push("Total".to_string());
        table.set_header(header);
        Self { table }
    }

    pub fn add_queue(&mut self, stats: &QueueStats) {
        let mut row = vec![stats.queue_name.clone()];
        row.extend(
            JobState::ALL
                .iter()
                .map(|state| stats.count(*state).to_string()),
        );
        row.push(stats.total().to_string());
        self.table.add_row(row);
    }
}

impl fmt::Display for StatsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

/// Multi-line description of one job.
pub fn job_details(job: &Job) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID".to_string(), job.id.to_string()]);
    table.add_row(vec!["Queue".to_string(), job.queue_name.clone()]);
    table.add_row(vec!["Type".to_string(), job.payload.job_type.clone()]);
    table.add_row(vec![
        "State".to_string(),
        format!("{} {}", state_icon(job.state), job.state),
    ]);
    table.add_row(vec!["Attempts".to_string(), job.attempts.to_string()]);
    table.add_row(vec!["Created At".to_string(), format_time(job.created_at)]);
    table.add_row(vec!["Due At".to_string(), format_time(job.due_at)]);
    if let Some(lease) = job.lease() {
        table.add_row(vec![
            "Lease".to_string(),
            format!("{} until {}", lease.worker_id, format_time(lease.expires_at)),
        ]);
    }
    if let Some(finished_at) = job.finished_at {
        table.add_row(vec!["Finished At".to_string(), format_time(finished_at)]);
    }
    if let Some(error) = &job.last_error {
        table.add_row(vec!["Last Error".to_string(), error.clone()]);
    }
    table.add_row(vec!["Payload".to_string(), format_payload(&job.payload.data)]);
    table.to_string()
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// UTF-8 payloads are shown as text, anything else as a byte count.
pub fn format_payload(data: &[u8]) -> String {
    const PREVIEW: usize = 200;
    match std::str::from_utf8(data) {
        Ok(text) if text.chars().count() > PREVIEW => {
            format!("{}…", text.chars().take(PREVIEW).collect::<String>())
        }
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes of binary data>", data.len()),
    }
}
