// ABOUTME: Integration tests against real PostgreSQL source and target databases
// ABOUTME: Ignored by default; set TEST_SOURCE_URL and TEST_TARGET_URL and run with --ignored

use change_relay::config::TableConfig;
use change_relay::relay::{
    BindError, ChangeReader, ChangeWriter, ConsumerConfig, DaemonConfig, DeliveryLoop,
    JsonFileWatermarks, MergePlan, SyncDaemon, WatermarkStore,
};
use change_relay::schema::ColumnValue;
use change_relay::store::postgres::{connect, PostgresSource, PostgresTarget};
use change_relay::store::MemoryTarget;
use change_relay::transport::QueueTransport;
use rust_decimal::Decimal;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((source, target))
}

fn test_table_name(suffix: &str) -> String {
    format!("relay_test_{}", suffix)
}

async fn create_table(client: &tokio_postgres::Client, table_name: &str) {
    client
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "public"."{0}";
            CREATE TABLE "public"."{0}" (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                amount NUMERIC(10, 2),
                seen_at TIMESTAMPTZ,
                rowver BIGINT NOT NULL
            )
            "#,
            table_name
        ))
        .await
        .expect("Failed to create test table");
}

async fn drop_table(client: &tokio_postgres::Client, table_name: &str) {
    let _ = client
        .batch_execute(&format!(
            r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#,
            table_name
        ))
        .await;
}

/// Test: the reader picks up rows above the watermark with identity discovered from the PK
#[tokio::test]
#[ignore]
async fn test_postgres_reader_reads_changes() {
    let (source_url, _target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let admin = connect(&source_url, false)
        .await
        .expect("Failed to connect to source");
    let table_name = test_table_name("reader");
    create_table(&admin, &table_name).await;
    admin
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name, amount, seen_at, rowver) VALUES
               (1, 'a', 1.50, now(), 1), (2, 'b', NULL, NULL, 2), (3, 'c', 3.25, now(), 3)"#,
            table_name
        ))
        .await
        .expect("Failed to insert rows");

    let source = PostgresSource::new(
        connect(&source_url, false)
            .await
            .expect("Failed to connect to source"),
        "public",
    );
    let reader = ChangeReader::new(&source);
    let extraction = reader
        .read_changes(&TableConfig::new(&table_name), 1, None)
        .await
        .expect("Failed to read changes");

    assert_eq!(extraction.change_count(), 2);
    assert_eq!(extraction.new_watermark, 3);
    assert_eq!(extraction.batch.identity_column, "id");

    drop_table(&admin, &table_name).await;
}

/// Test: money, bit and "char" columns are read as values, never as NULL
#[tokio::test]
#[ignore]
async fn test_postgres_reader_reads_money_and_bit() {
    let (source_url, _target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let admin = connect(&source_url, false)
        .await
        .expect("Failed to connect to source");
    let table_name = test_table_name("money");
    admin
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "public"."{0}";
            CREATE TABLE "public"."{0}" (
                id INTEGER PRIMARY KEY,
                bal MONEY,
                flag BIT(1),
                kind "char",
                addr INET,
                rowver BIGINT NOT NULL
            );
            INSERT INTO "public"."{0}" VALUES (1, 12.34, B'1', 'r', '10.0.0.1', 1);
            "#,
            table_name
        ))
        .await
        .expect("Failed to create test table");

    let source = PostgresSource::new(
        connect(&source_url, false)
            .await
            .expect("Failed to connect to source"),
        "public",
    );
    let extraction = ChangeReader::new(&source)
        .read_changes(&TableConfig::new(&table_name), 0, None)
        .await
        .expect("Failed to read changes");
    let batch = &extraction.batch;
    let row = &batch.rows[0];

    assert_eq!(batch.schema[1].logical_type, "money");
    assert_eq!(row[1], ColumnValue::Decimal(Decimal::new(1234, 2)));
    assert_eq!(row[2], ColumnValue::Bool(true));
    assert_eq!(row[3], ColumnValue::Text("r".into()));
    assert_eq!(row[4], ColumnValue::Text("10.0.0.1".into()));

    // inet has no binder type, so the row is refused rather than nulled
    let plan = MergePlan::for_batch(batch, "").unwrap();
    assert!(matches!(
        plan.bind_row(batch, row),
        Err(BindError::UnknownType { ref column, .. }) if column == "addr"
    ));

    drop_table(&admin, &table_name).await;
}

/// Test: a numeric NaN row is skipped at apply time and the rows after it still flow
#[tokio::test]
#[ignore]
async fn test_postgres_nan_row_does_not_block_table() {
    let (source_url, _target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let admin = connect(&source_url, false)
        .await
        .expect("Failed to connect to source");
    let table_name = test_table_name("nan");
    admin
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "public"."{0}";
            CREATE TABLE "public"."{0}" (
                id INTEGER PRIMARY KEY,
                v NUMERIC,
                seen_at TIMESTAMPTZ,
                rowver BIGINT NOT NULL
            );
            INSERT INTO "public"."{0}" VALUES
                (1, 'NaN', 'infinity', 1),
                (2, 5, now(), 2);
            "#,
            table_name
        ))
        .await
        .expect("Failed to create test table");

    let source = PostgresSource::new(
        connect(&source_url, false)
            .await
            .expect("Failed to connect to source"),
        "public",
    );
    let extraction = ChangeReader::new(&source)
        .read_changes(&TableConfig::new(&table_name), 0, None)
        .await
        .expect("Failed to read changes");

    assert_eq!(extraction.change_count(), 2);
    assert_eq!(extraction.new_watermark, 2);
    let rows = &extraction.batch.rows;
    assert!(matches!(rows[0][1], ColumnValue::Float(v) if v.is_nan()));
    assert_eq!(rows[0][2], ColumnValue::Text("infinity".into()));
    assert_eq!(rows[1][1], ColumnValue::Decimal(Decimal::new(5, 0)));

    let target = Arc::new(MemoryTarget::new());
    let received = change_relay::relay::Envelope::seal(&extraction.batch, 0, 2)
        .unwrap()
        .open()
        .unwrap();
    let report = ChangeWriter::new(target.clone())
        .apply_batch(&received)
        .await
        .unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 1);
    assert!(target.row(&table_name, &ColumnValue::Int(2)).is_some());

    drop_table(&admin, &table_name).await;
}

/// Test: full relay from source to target through the SQLite queue, then an update
#[tokio::test]
#[ignore]
async fn test_postgres_relay_end_to_end() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let source_admin = connect(&source_url, false)
        .await
        .expect("Failed to connect to source");
    let target_admin = connect(&target_url, false)
        .await
        .expect("Failed to connect to target");

    let table_name = test_table_name("flow");
    create_table(&source_admin, &table_name).await;
    create_table(&target_admin, &table_name).await;
    source_admin
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name, amount, seen_at, rowver)
               SELECT g, 'row ' || g, g * 1.25, now(), g FROM generate_series(1, 20) g"#,
            table_name
        ))
        .await
        .expect("Failed to insert rows");

    let temp = TempDir::new().unwrap();
    let transport = Arc::new(
        QueueTransport::open(
            &temp.path().join("queue.db"),
            Duration::from_secs(30),
            Duration::from_millis(20),
        )
        .unwrap(),
    );
    let watermarks = WatermarkStore::open(Box::new(JsonFileWatermarks::new(
        temp.path().join("watermarks.json"),
    )))
    .await
    .unwrap();

    let source = Arc::new(PostgresSource::new(
        connect(&source_url, false)
            .await
            .expect("Failed to connect to source"),
        "public",
    ));
    let mut daemon = SyncDaemon::new(
        DaemonConfig {
            tables: vec![TableConfig::new(&table_name)],
            table_delay: Duration::ZERO,
            pass_backoff: Duration::from_millis(10),
            batch_size: Some(8),
        },
        source.clone(),
        transport.clone(),
        watermarks,
    );

    let target = Arc::new(PostgresTarget::new(
        connect(&target_url, false)
            .await
            .expect("Failed to connect to target"),
        Some("public".to_string()),
    ));
    let delivery = DeliveryLoop::new(
        ConsumerConfig {
            max_concurrent: 2,
            idle_wait: Duration::from_millis(50),
            max_delivery_count: Some(3),
        },
        transport.clone(),
        Arc::new(ChangeWriter::new(target.clone())),
    );

    // 20 rows at 8 per pass
    for _ in 0..3 {
        daemon.run_pass().await.unwrap();
    }
    assert_eq!(daemon.watermarks().get(&table_name), 20);

    let stats = delivery.drain().await.unwrap();
    assert_eq!(stats.applied, 3);
    assert_eq!(stats.rows_inserted, 20);

    source_admin
        .batch_execute(&format!(
            r#"UPDATE "public"."{}" SET name = 'changed', rowver = 21 WHERE id = 7"#,
            table_name
        ))
        .await
        .unwrap();
    daemon.run_pass().await.unwrap();
    let stats = delivery.drain().await.unwrap();
    assert_eq!(stats.rows_updated, 1);

    let row = target_admin
        .query_one(
            &format!(
                r#"SELECT name, rowver FROM "public"."{}" WHERE id = 7"#,
                table_name
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>(0), "changed");
    assert_eq!(row.get::<_, i64>(1), 21);

    let count: i64 = target_admin
        .query_one(&format!(r#"SELECT count(*) FROM "public"."{}""#, table_name), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 20);
    assert_eq!(transport.pending_count().await.unwrap(), 0);

    drop_table(&source_admin, &table_name).await;
    drop_table(&target_admin, &table_name).await;
}
