//! Bulk loader against a migrated test database

mod common;

use std::path::PathBuf;

use cnpj_server::ingest::decoder::ArchiveExtraction;
use cnpj_server::ingest::loader::{strategy_for, LoadStrategy, StreamingCopy};
use cnpj_server::ingest::{Batch, BulkLoader, DatasetType, LoadMode, Record, RecordDecoder};
use sqlx::PgPool;

fn lookup(dataset: DatasetType, codigo: &str, descricao: Option<&str>) -> Record {
    Record {
        dataset,
        values: vec![Some(codigo.to_string()), descricao.map(str::to_string)],
        composite_id: None,
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_bulk_insert_lookup_rows(pool: PgPool) {
    let mut loader = BulkLoader::connect(&pool).await.unwrap();
    let batch = Batch {
        dataset: DatasetType::Cnae,
        records: vec![
            lookup(DatasetType::Cnae, "01", Some("Description A")),
            lookup(DatasetType::Cnae, "02", Some("Tab\tand \\ backslash")),
            lookup(DatasetType::Cnae, "03", None),
        ],
    };

    let rows = loader.bulk_insert(&batch).await.unwrap();

    assert_eq!(rows, 3);
    assert_eq!(loader.counts().get(&DatasetType::Cnae), Some(&3));
    let stored: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT codigo, descricao FROM cnaes ORDER BY codigo")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(stored[0], ("01".to_string(), Some("Description A".to_string())));
    assert_eq!(stored[1].1.as_deref(), Some("Tab\tand \\ backslash"));
    assert_eq!(stored[2].1, None);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_failed_batch_rolls_back_alone(pool: PgPool) {
    let mut loader = BulkLoader::connect(&pool).await.unwrap();
    let first = Batch {
        dataset: DatasetType::Pais,
        records: vec![lookup(DatasetType::Pais, "105", Some("BRASIL"))],
    };
    loader.bulk_insert(&first).await.unwrap();

    // duplicate key inside the second batch violates the unique constraint
    let second = Batch {
        dataset: DatasetType::Pais,
        records: vec![
            lookup(DatasetType::Pais, "249", Some("ESTADOS UNIDOS")),
            lookup(DatasetType::Pais, "105", Some("BRASIL")),
        ],
    };
    assert!(loader.bulk_insert(&second).await.is_err());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM paises")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(loader.total_loaded(), 1);

    // the session is still usable
    let third = Batch {
        dataset: DatasetType::Pais,
        records: vec![lookup(DatasetType::Pais, "249", Some("ESTADOS UNIDOS"))],
    };
    assert_eq!(loader.bulk_insert(&third).await.unwrap(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_streaming_establishment_composite(pool: PgPool) {
    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join("Estabelecimentos0.zip");
    std::fs::write(&zip_path, common::establishment_archive()).unwrap();

    let extraction = ArchiveExtraction::open(&zip_path, &dir.path().join("scratch")).unwrap();
    let files = extraction.dataset_files();
    assert_eq!(files.len(), 1);
    let (path, dataset) = &files[0];
    assert_eq!(*dataset, DatasetType::Estabelecimento);

    let mut loader = BulkLoader::connect(&pool).await.unwrap();
    let load = StreamingCopy
        .load_file(&mut loader, &RecordDecoder::new(10), path, *dataset)
        .await
        .unwrap();
    assert_eq!(load.rows, 1);
    assert_eq!(load.stats.errors, 0);

    let row: (String, Option<String>, Option<String>, Option<String>) = sqlx::query_as(
        "SELECT cnpj_completo, nome_fantasia, uf, data_situacao_especial FROM estabelecimentos",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.0, "12345678000190");
    assert_eq!(row.1, None);
    assert_eq!(row.2, None);
    assert_eq!(row.3, None);
    assert_eq!(loader.count_missing_composite().await.unwrap(), 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_count_missing_composite(pool: PgPool) {
    let mut values = vec![None; DatasetType::Estabelecimento.columns().len()];
    values[0] = Some("87654321".to_string());
    values[1] = Some("0001".to_string());
    let batch = Batch {
        dataset: DatasetType::Estabelecimento,
        records: vec![Record {
            dataset: DatasetType::Estabelecimento,
            values,
            composite_id: None,
        }],
    };

    let mut loader = BulkLoader::connect(&pool).await.unwrap();
    loader.bulk_insert(&batch).await.unwrap();

    assert_eq!(loader.count_missing_composite().await.unwrap(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_truncate_and_maintenance(pool: PgPool) {
    let mut loader = BulkLoader::connect(&pool).await.unwrap();
    let batch = Batch {
        dataset: DatasetType::Motivo,
        records: vec![lookup(DatasetType::Motivo, "00", Some("SEM MOTIVO"))],
    };
    loader.bulk_insert(&batch).await.unwrap();

    loader.truncate_table(DatasetType::Motivo).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM motivos")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);

    assert!(loader.create_indexes().await.is_empty());
    // idempotent
    assert!(loader.create_indexes().await.is_empty());
    assert!(loader
        .update_statistics(&DatasetType::DEPENDENCY_ORDER)
        .await
        .is_empty());
    loader.vacuum_analyze().await.unwrap();

    let unique: bool = sqlx::query_scalar(
        "SELECT indisunique FROM pg_index WHERE indexrelid = 'idx_estabelecimentos_cnpj_completo'::regclass",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(unique);
}

/// URL of the per-test database, for strategies that open their own pool
async fn test_database_url(pool: &PgPool) -> String {
    let database: String = sqlx::query_scalar("SELECT current_database()")
        .fetch_one(pool)
        .await
        .unwrap();
    let base = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for sqlx tests");
    let mut url = reqwest::Url::parse(&base).unwrap();
    url.set_path(&format!("/{}", database));
    url.to_string()
}

/// Staging directory plus the path the database server sees for it.
///
/// Defaults to a local directory, which works when the server shares this
/// filesystem. A server in a container needs both variables set to a
/// mounted directory.
fn staging_dirs(root: &std::path::Path) -> (PathBuf, PathBuf) {
    match (
        std::env::var("CNPJ_TEST_STAGING_DIR"),
        std::env::var("CNPJ_TEST_STAGING_SERVER_DIR"),
    ) {
        (Ok(local), Ok(server)) => (PathBuf::from(local), PathBuf::from(server)),
        _ => {
            let local = root.join("staging");
            std::fs::create_dir_all(&local).unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                // the server process runs as another OS user
                for dir in [root, local.as_path()] {
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).unwrap();
                }
            }
            (local.clone(), local)
        },
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_staged_copy_loads_rows(pool: PgPool) {
    let dir = tempfile::tempdir().unwrap();
    let (staging_dir, staging_server_dir) = staging_dirs(dir.path());

    let source = dir.path().join("F.K03200$Z.D40511.MOTICSV");
    std::fs::write(
        &source,
        b"\"00\";\"SEM MOTIVO\"\n\"\";\"sem codigo\"\n\"01\";\"EXTINCAO\"\n",
    )
    .unwrap();

    let config = cnpj_server::ingest::EtlConfig {
        load_mode: LoadMode::Staged,
        admin_database_url: Some(test_database_url(&pool).await),
        staging_dir: staging_dir.clone(),
        staging_server_dir: Some(staging_server_dir),
        ..common::test_config(dir.path(), "http://127.0.0.1:9")
    };
    let strategy = strategy_for(&config).unwrap();
    assert_eq!(strategy.name(), "staged");

    let mut loader = BulkLoader::connect(&pool).await.unwrap();
    let load = strategy
        .load_file(&mut loader, &RecordDecoder::new(1), &source, DatasetType::Motivo)
        .await
        .unwrap();

    assert_eq!(load.rows, 2);
    assert_eq!(load.stats.errors, 1);
    assert_eq!(loader.counts().get(&DatasetType::Motivo), Some(&2));
    assert_eq!(loader.total_loaded(), 2);

    let stored: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT codigo, descricao FROM motivos ORDER BY codigo")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(
        stored,
        vec![
            ("00".to_string(), Some("SEM MOTIVO".to_string())),
            ("01".to_string(), Some("EXTINCAO".to_string())),
        ]
    );

    // staging file removed after the COPY
    let leftovers = std::fs::read_dir(&staging_dir).unwrap().count();
    assert_eq!(leftovers, 0);
}
