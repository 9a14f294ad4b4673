use anyhow::Result;
use backlot::{JobId, JobState};
use std::time::Duration;

pub fn validate_state(state: &str) -> Result<JobState> {
    state.parse().map_err(|_| {
        let valid: Vec<&str> = JobState::ALL.iter().map(JobState::as_str).collect();
        anyhow::anyhow!(
            "Invalid state '{}'. Valid options: {}",
            state,
            valid.join(", ")
        )
    })
}

pub fn validate_json_payload(payload: &str) -> Result<serde_json::Value> {
    serde_json::from_str(payload).map_err(|e| anyhow::anyhow!("Invalid JSON payload: {}", e))
}

pub fn validate_database_url(url: &str) -> Result<()> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid database URL. Must start with postgres:// or postgresql://"
        ))
    }
}

pub fn validate_queue(queue: &str) -> Result<()> {
    backlot::queue::validate_queue_name(queue).map_err(|e| anyhow::anyhow!("{}", e))
}

pub fn parse_job_id(id: &str) -> Result<JobId> {
    id.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid job ID '{}': expected a UUID", id))
}

pub fn parse_duration(value: &str) -> Result<Duration> {
    backlot::config::parse_duration(value).map_err(|e| anyhow::anyhow!("{}", e))
}
