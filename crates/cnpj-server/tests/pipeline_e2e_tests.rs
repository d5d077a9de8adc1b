//! Full runs through `EtlService` against a mock file server and a
//! migrated test database

mod common;

use std::path::Path;
use std::time::Duration;

use cnpj_common::logging::LogConfig;
use cnpj_server::ingest::ledger::ArchiveLedger;
use cnpj_server::ingest::lock::{Acquire, JobLock};
use cnpj_server::ingest::service::StartError;
use cnpj_server::ingest::{DatasetType, EtlConfig, EtlService, JobStatus, StartRequest};
use sqlx::{Connection, PgPool};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const PERIOD: &str = "2024-05";

fn motivo_archive() -> Vec<u8> {
    common::zip_bytes(&[(
        "F.K03200$Z.D40511.MOTICSV",
        b"\"00\";\"SEM MOTIVO\"\n\"01\";\"EXTINCAO POR ENCERRAMENTO\"\n",
    )])
}

fn service(pool: PgPool, config: EtlConfig, root: &Path) -> EtlService {
    let log_config = LogConfig::builder().log_dir(root.join("logs")).build();
    EtlService::new(pool, config, log_config)
}

fn request(tables: &[&str]) -> StartRequest {
    StartRequest {
        tables: tables.iter().map(|t| t.to_string()).collect(),
        period: Some(PERIOD.to_string()),
        ..StartRequest::default()
    }
}

async fn serve_period(server: &MockServer, archives: &[(&str, Vec<u8>)]) {
    let names: Vec<&str> = archives.iter().map(|(name, _)| *name).collect();
    Mock::given(method("GET"))
        .and(path(format!("/{}/", PERIOD)))
        .respond_with(ResponseTemplate::new(200).set_body_string(common::listing(&names)))
        .mount(server)
        .await;
    for (name, body) in archives {
        Mock::given(method("GET"))
            .and(path(format!("/{}/{}", PERIOD, name)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(server)
            .await;
    }
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_lookup_archive_end_to_end(pool: PgPool) {
    let server = MockServer::start().await;
    serve_period(&server, &[("Cnaes.zip", common::cnae_archive())]).await;

    let dir = tempfile::tempdir().unwrap();
    let config = common::test_config(dir.path(), &server.uri());
    let period_dir = config.period_dir(PERIOD);
    let service = service(pool.clone(), config, dir.path());

    let (job_id, outcome) = service.run(request(&["auxiliares"])).await.unwrap();
    assert_eq!(outcome, JobStatus::Completed);

    let record = service.job(&job_id).await.unwrap().unwrap();
    assert_eq!(record.job_status(), JobStatus::Completed);
    assert_eq!(record.period.as_deref(), Some(PERIOD));
    assert_eq!(record.records_imported, 2);
    assert_eq!(record.files_processed, 1);
    assert_eq!(record.files_total, 1);
    assert_eq!(record.progress_percent, 100.0);
    assert!(record.completed_at.is_some());
    assert_eq!(record.metadata.processed_files, vec!["Cnaes.zip"]);
    assert_eq!(record.metadata.rows_per_table.get("cnaes"), Some(&2));
    assert_eq!(record.metadata.load_mode.as_deref(), Some("streaming"));

    let descricao: String =
        sqlx::query_scalar("SELECT descricao FROM cnaes WHERE codigo = '0111301'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(descricao, "Cultivo de arroz");

    // consumed archives are deleted and recorded
    assert!(!period_dir.join("Cnaes.zip").exists());
    let loaded = ArchiveLedger::new(pool.clone()).loaded(PERIOD).await.unwrap();
    assert!(loaded.contains("Cnaes.zip"));
    assert!(JobLock::holder(&pool).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_local_establishment_archive(pool: PgPool) {
    let dir = tempfile::tempdir().unwrap();
    let config = common::test_config(dir.path(), "http://127.0.0.1:9");
    let period_dir = config.period_dir(PERIOD);
    std::fs::create_dir_all(&period_dir).unwrap();
    // another period's archive in the flat data directory is ignored
    std::fs::write(config.data_dir.join("Estabelecimentos1.zip"), common::establishment_archive())
        .unwrap();
    std::fs::write(
        period_dir.join("Estabelecimentos0.zip"),
        common::establishment_archive(),
    )
    .unwrap();
    let service = service(pool.clone(), config, dir.path());

    let mut req = request(&["estabelecimentos"]);
    req.skip_download = true;
    let (job_id, outcome) = service.run(req).await.unwrap();
    assert_eq!(outcome, JobStatus::Completed);

    let cnpj: String = sqlx::query_scalar("SELECT cnpj_completo FROM estabelecimentos")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(cnpj, "12345678000190");

    let record = service.job(&job_id).await.unwrap().unwrap();
    assert_eq!(record.records_imported, 1);
    assert_eq!(record.metadata.processed_files, vec!["Estabelecimentos0.zip"]);
    assert!(!record.warnings.iter().any(|w| w.contains("cnpj_completo")));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_corrupt_archive_is_contained(pool: PgPool) {
    let server = MockServer::start().await;
    serve_period(
        &server,
        &[
            ("Cnaes.zip", common::cnae_archive()),
            ("Motivos.zip", b"this is not a zip file".to_vec()),
        ],
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let service = service(pool.clone(), common::test_config(dir.path(), &server.uri()), dir.path());

    let (job_id, outcome) = service.run(request(&["auxiliares"])).await.unwrap();
    assert_eq!(outcome, JobStatus::Completed);

    let record = service.job(&job_id).await.unwrap().unwrap();
    assert_eq!(record.files_total, 2);
    // the failed archive shows up in warnings, not in the processed count
    assert_eq!(record.files_processed, 1);
    assert_eq!(record.progress_percent, 100.0);
    assert_eq!(record.records_imported, 2);
    assert_eq!(record.metadata.failed_files.len(), 1);
    assert_eq!(record.metadata.failed_files[0].archive, "Motivos.zip");
    assert_eq!(record.metadata.failed_files[0].rows_committed, 0);
    assert!(record.warnings.iter().any(|w| w.starts_with("Failed to process Motivos.zip")));

    assert_eq!(count(&pool, "cnaes").await, 2);
    assert_eq!(count(&pool, "motivos").await, 0);
    let loaded = ArchiveLedger::new(pool.clone()).loaded(PERIOD).await.unwrap();
    assert!(!loaded.contains("Motivos.zip"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_start_rejected_while_lock_held(pool: PgPool) {
    let mut conn = pool.acquire().await.unwrap();
    let mut tx = conn.begin().await.unwrap();
    let held = JobLock::try_acquire(&mut tx, "etl_elsewhere", Duration::from_secs(300))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(matches!(held, Acquire::Acquired { .. }));

    let dir = tempfile::tempdir().unwrap();
    let service = service(pool.clone(), common::test_config(dir.path(), "http://127.0.0.1:9"), dir.path());

    match service.run(request(&["auxiliares"])).await {
        Err(StartError::AlreadyRunning { job_id }) => assert_eq!(job_id, "etl_elsewhere"),
        other => panic!("expected AlreadyRunning, got {:?}", other.map(|(id, _)| id)),
    }
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM etl_status")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_resume_skips_loaded_archives(pool: PgPool) {
    let server = MockServer::start().await;
    serve_period(
        &server,
        &[("Cnaes.zip", common::cnae_archive()), ("Motivos.zip", motivo_archive())],
    )
    .await;

    ArchiveLedger::new(pool.clone())
        .record(PERIOD, "Cnaes.zip", DatasetType::Cnae, 2, "etl_earlier")
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let service = service(pool.clone(), common::test_config(dir.path(), &server.uri()), dir.path());

    let mut req = request(&["auxiliares"]);
    req.resume = true;
    let (job_id, outcome) = service.run(req).await.unwrap();
    assert_eq!(outcome, JobStatus::Completed);

    let record = service.job(&job_id).await.unwrap().unwrap();
    assert_eq!(record.files_total, 1);
    assert_eq!(record.metadata.processed_files, vec!["Motivos.zip"]);
    assert_eq!(count(&pool, "cnaes").await, 0);
    assert_eq!(count(&pool, "motivos").await, 2);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_invalid_requests_are_rejected(pool: PgPool) {
    let dir = tempfile::tempdir().unwrap();
    let service = service(pool.clone(), common::test_config(dir.path(), "http://127.0.0.1:9"), dir.path());

    let mut bad_period = request(&["auxiliares"]);
    bad_period.period = Some("2024-13".to_string());
    assert!(matches!(
        service.run(bad_period).await,
        Err(StartError::InvalidRequest(_))
    ));

    let mut conflicting = request(&["auxiliares"]);
    conflicting.resume = true;
    conflicting.truncate = true;
    assert!(matches!(
        service.run(conflicting).await,
        Err(StartError::InvalidRequest(_))
    ));

    assert!(JobLock::holder(&pool).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_empty_listing_ends_in_error(pool: PgPool) {
    let server = MockServer::start().await;
    serve_period(&server, &[]).await;

    let dir = tempfile::tempdir().unwrap();
    let service = service(pool.clone(), common::test_config(dir.path(), &server.uri()), dir.path());

    let (job_id, outcome) = service.run(request(&["auxiliares"])).await.unwrap();
    assert_eq!(outcome, JobStatus::Error);

    let record = service.job(&job_id).await.unwrap().unwrap();
    assert!(record
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("No archives found")));
    assert!(JobLock::holder(&pool).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_back_to_back_starts_get_distinct_ids(pool: PgPool) {
    let server = MockServer::start().await;
    serve_period(&server, &[]).await;

    let dir = tempfile::tempdir().unwrap();
    let service = service(pool.clone(), common::test_config(dir.path(), &server.uri()), dir.path());

    // both runs fail fast, well inside one second
    let (first, first_outcome) = service.run(request(&["auxiliares"])).await.unwrap();
    let (second, second_outcome) = service.run(request(&["auxiliares"])).await.unwrap();

    assert_eq!(first_outcome, JobStatus::Error);
    assert_eq!(second_outcome, JobStatus::Error);
    assert_ne!(first, second);
    assert!(second.starts_with("etl_"));
    assert!(service.job(&first).await.unwrap().is_some());
    assert!(service.job(&second).await.unwrap().is_some());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_lookups_load_before_entities(pool: PgPool) {
    let server = MockServer::start().await;
    serve_period(
        &server,
        &[
            ("Empresas0.zip", common::empresa_archive()),
            ("Estabelecimentos0.zip", common::establishment_archive()),
            ("Cnaes.zip", common::cnae_archive()),
            ("Motivos.zip", motivo_archive()),
        ],
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let service = service(pool.clone(), common::test_config(dir.path(), &server.uri()), dir.path());

    let (job_id, outcome) = service
        .run(request(&["auxiliares", "empresas", "estabelecimentos"]))
        .await
        .unwrap();
    assert_eq!(outcome, JobStatus::Completed);

    let record = service.job(&job_id).await.unwrap().unwrap();
    assert_eq!(
        record.metadata.processed_files,
        vec!["Cnaes.zip", "Motivos.zip", "Empresas0.zip", "Estabelecimentos0.zip"]
    );

    let lookups_done: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(
        "SELECT MAX(loaded_at) FROM etl_loaded_archives WHERE dataset IN ('cnae', 'motivo')",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    let entities_start: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(
        "SELECT MIN(loaded_at) FROM etl_loaded_archives WHERE dataset IN ('empresa', 'estabelecimento')",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(lookups_done < entities_start);
    assert_eq!(count(&pool, "empresas").await, 1);
    assert_eq!(count(&pool, "estabelecimentos").await, 1);
}
