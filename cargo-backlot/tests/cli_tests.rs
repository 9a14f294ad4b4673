use backlot::{
    BacklotConfig, Job, JobFilter, JobState, JobStore, MemoryStore, Payload, QueueStats,
    config::StoreBackend,
};
use cargo_backlot::commands::config::settings_table;
use cargo_backlot::commands::server::{DEMO_JOB_TYPE, demo_registry};
use cargo_backlot::commands::{JobCommand, MaintenanceCommand, QueueCommand};
use cargo_backlot::config::{Config, log_directives};
use cargo_backlot::utils::display::{JobTable, StatsTable, format_payload, job_details};
use cargo_backlot::utils::validation::{
    parse_duration, parse_job_id, validate_database_url, validate_json_payload, validate_queue,
    validate_state,
};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[derive(Parser)]
struct JobCli {
    #[command(subcommand)]
    command: JobCommand,
}

fn memory_store() -> Arc<dyn JobStore> {
    Arc::new(MemoryStore::new())
}

fn sample_job(state: JobState) -> Job {
    let now = Utc::now();
    let mut job = Job::new(
        "email",
        Payload::new("send_email", br#"{"to":"ops@example.com"}"#.to_vec()),
        now,
        now,
        1,
    );
    job.state = state;
    job
}

#[test]
fn test_validate_state() {
    assert_eq!(validate_state("dead").unwrap(), JobState::Dead);
    assert_eq!(validate_state("Enqueued").unwrap(), JobState::Enqueued);

    let err = validate_state("running").unwrap_err().to_string();
    assert!(err.contains("Valid options"));
    assert!(err.contains("scheduled"));
}

#[test]
fn test_validate_inputs() {
    assert!(validate_json_payload(r#"{"a": 1}"#).is_ok());
    assert!(validate_json_payload("{not json").is_err());

    assert!(validate_database_url("postgres://localhost/db").is_ok());
    assert!(validate_database_url("postgresql://localhost/db").is_ok());
    assert!(validate_database_url("mysql://localhost/db").is_err());

    assert!(validate_queue("critical").is_ok());
    assert!(validate_queue("").is_err());

    assert!(parse_job_id("not-a-uuid").is_err());
    let id = uuid::Uuid::new_v4();
    assert_eq!(parse_job_id(&format!(" {} ", id)).unwrap(), id);

    assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
    assert!(parse_duration("soon").is_err());
    assert!(parse_duration("1µ").is_err());
}

#[test]
fn test_job_table_rendering() {
    let mut table = JobTable::new();
    assert!(table.is_empty());

    let job = sample_job(JobState::Dead);
    table.add_job(&job);
    assert_eq!(table.len(), 1);

    let rendered = table.to_string();
    assert!(rendered.contains("email"));
    assert!(rendered.contains("send_email"));
    assert!(rendered.contains("💀 dead"));
    assert!(rendered.contains(&job.id.to_string()[..8]));
}

#[test]
fn test_stats_table_rendering() {
    let mut stats = QueueStats::new("critical");
    stats.add(JobState::Enqueued, 3);
    stats.add(JobState::Dead, 1);

    let mut table = StatsTable::new();
    table.add_queue(&stats);
    let rendered = table.to_string();
    assert!(rendered.contains("critical"));
    assert!(rendered.contains("Total"));
    assert!(rendered.contains('4'));
}

#[test]
fn test_job_details_include_error_and_payload() {
    let mut job = sample_job(JobState::Failed);
    job.last_error = Some("smtp rejected recipient".to_string());
    job.finished_at = Some(Utc::now());

    let details = job_details(&job);
    assert!(details.contains("smtp rejected recipient"));
    assert!(details.contains("ops@example.com"));
    assert!(details.contains("Finished At"));
    assert!(!details.contains("Lease"));
}

#[test]
fn test_format_payload() {
    assert_eq!(format_payload(b"hello"), "hello");
    assert_eq!(format_payload(&[0xff, 0xfe, 0x00]), "<3 bytes of binary data>");

    let long = "x".repeat(500);
    let preview = format_payload(long.as_bytes());
    assert_eq!(preview.chars().count(), 201);
    assert!(preview.ends_with('…'));
}

#[test]
fn test_config_save_and_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let settings = BacklotConfig::new()
        .with_database_url("postgres://localhost/backlot_cli")
        .with_worker_count(3);
    Config::with_settings(settings.clone(), path.clone())
        .save()
        .unwrap();
    assert!(path.exists());

    let loaded = BacklotConfig::from_file(&path).unwrap();
    assert_eq!(loaded, settings);
    assert_eq!(loaded.store.backend, StoreBackend::Postgres);
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let config = Config::load(Some(&path)).unwrap();
    assert!(!config.from_file);
    assert_eq!(config.path, path);
}

#[test]
fn test_malformed_config_file_is_an_error() {
    let dir = tempdir().unwrap();

    let bad_queue = dir.path().join("bad_queue.toml");
    std::fs::write(&bad_queue, "[server]\nqueues = [\"bad name!\"]\n").unwrap();
    assert!(Config::load(Some(&bad_queue)).is_err());

    let bad_duration = dir.path().join("bad_duration.toml");
    std::fs::write(&bad_duration, "[server]\nlease_duration = \"5µ\"\n").unwrap();
    assert!(Config::load(Some(&bad_duration)).is_err());

    let bad_workers = dir.path().join("bad_workers.toml");
    std::fs::write(&bad_workers, "[server]\nworker_count = 0\n").unwrap();
    let err = Config::load(Some(&bad_workers)).unwrap_err();
    assert!(format!("{:#}", err).contains("bad_workers.toml"));
}

#[test]
fn test_log_directives() {
    assert_eq!(log_directives("debug"), "cargo_backlot=debug,backlot=debug");
    assert_eq!(log_directives("backlot=trace"), "backlot=trace");
    assert_eq!(
        log_directives("info,backlot::worker=debug"),
        "info,backlot::worker=debug"
    );
}

#[test]
fn test_database_url_resolution() {
    let path = std::path::PathBuf::from("unused.toml");

    let memory = Config::with_settings(BacklotConfig::default(), path.clone());
    assert_eq!(memory.database_url(None), None);
    assert_eq!(
        memory.database_url(Some("postgres://explicit/db")).as_deref(),
        Some("postgres://explicit/db")
    );

    let postgres = Config::with_settings(
        BacklotConfig::new().with_database_url("postgres://configured/db"),
        path,
    );
    assert_eq!(
        postgres.database_url(None).as_deref(),
        Some("postgres://configured/db")
    );
}

#[test]
fn test_settings_table_lists_key_settings() {
    let config = Config::with_settings(BacklotConfig::default(), "unused.toml".into());
    let rendered = settings_table(&config).to_string();
    assert!(rendered.contains("server.worker_count"));
    assert!(rendered.contains("retry.max_attempts"));
    assert!(rendered.contains("memory"));
    assert!(rendered.contains("defaults + env"));
}

#[test]
fn test_parse_job_commands() {
    let cli = JobCli::parse_from([
        "test",
        "enqueue",
        "--queue",
        "critical",
        "--job-type",
        "send_email",
        "--payload",
        r#"{"to":"a@b.c"}"#,
        "--delay",
        "5m",
    ]);
    match cli.command {
        JobCommand::Enqueue {
            queue,
            job_type,
            delay,
            ..
        } => {
            assert_eq!(queue, "critical");
            assert_eq!(job_type, "send_email");
            assert_eq!(delay.as_deref(), Some("5m"));
        }
        other => panic!("unexpected command: {:?}", other),
    }

    let cli = JobCli::parse_from(["test", "list", "--state", "dead", "--limit", "5"]);
    match cli.command {
        JobCommand::List { state, limit, .. } => {
            assert_eq!(state.as_deref(), Some("dead"));
            assert_eq!(limit, 5);
        }
        other => panic!("unexpected command: {:?}", other),
    }
}

#[test]
fn test_demo_registry_has_demo_handler() {
    let registry = demo_registry().unwrap();
    assert!(registry.contains(DEMO_JOB_TYPE));
}

#[tokio::test]
async fn test_job_commands_against_memory_store() {
    let store = memory_store();

    JobCommand::Enqueue {
        database_url: None,
        queue: "critical".to_string(),
        job_type: "send_email".to_string(),
        payload: r#"{"to":"a@b.c"}"#.to_string(),
        delay: None,
    }
    .execute_with(Arc::clone(&store))
    .await
    .unwrap();

    JobCommand::Enqueue {
        database_url: None,
        queue: "low".to_string(),
        job_type: "report".to_string(),
        payload: "{}".to_string(),
        delay: Some("1h".to_string()),
    }
    .execute_with(Arc::clone(&store))
    .await
    .unwrap();

    let jobs = store.list_jobs(&JobFilter::new()).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let critical = jobs.iter().find(|j| j.queue_name == "critical").unwrap();
    let low = jobs.iter().find(|j| j.queue_name == "low").unwrap();
    assert_eq!(critical.state, JobState::Enqueued);
    assert_eq!(low.state, JobState::Scheduled);

    JobCommand::List {
        database_url: None,
        queue: None,
        state: Some("scheduled".to_string()),
        limit: 10,
        offset: 0,
    }
    .execute_with(Arc::clone(&store))
    .await
    .unwrap();

    JobCommand::Retry {
        database_url: None,
        job_id: low.id.to_string(),
    }
    .execute_with(Arc::clone(&store))
    .await
    .unwrap();
    assert_eq!(store.fetch(low.id).await.unwrap().state, JobState::Enqueued);

    JobCommand::Delete {
        database_url: None,
        job_id: critical.id.to_string(),
    }
    .execute_with(Arc::clone(&store))
    .await
    .unwrap();
    assert!(store.fetch(critical.id).await.is_err());

    let invalid = JobCommand::Enqueue {
        database_url: None,
        queue: "critical".to_string(),
        job_type: "send_email".to_string(),
        payload: "{broken".to_string(),
        delay: None,
    }
    .execute_with(Arc::clone(&store))
    .await;
    assert!(invalid.is_err());
}

#[tokio::test]
async fn test_queue_and_maintenance_commands_against_memory_store() {
    let store = memory_store();
    let config = Config::with_settings(BacklotConfig::default(), "unused.toml".into());

    JobCommand::Enqueue {
        database_url: None,
        queue: "default".to_string(),
        job_type: "noop".to_string(),
        payload: "{}".to_string(),
        delay: None,
    }
    .execute_with(Arc::clone(&store))
    .await
    .unwrap();

    QueueCommand::Stats {
        database_url: None,
        queue: None,
        failures: true,
    }
    .execute_with(Arc::clone(&store))
    .await
    .unwrap();

    for command in [
        MaintenanceCommand::Promote { database_url: None },
        MaintenanceCommand::Reap { database_url: None },
        MaintenanceCommand::Purge {
            database_url: None,
            retention: Some("1d".to_string()),
        },
    ] {
        command
            .execute_with(&config, Arc::clone(&store))
            .await
            .unwrap();
    }

    let jobs = store.list_jobs(&JobFilter::new()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Enqueued);
}
