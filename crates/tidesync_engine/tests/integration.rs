//! Integration tests: agents against an in-process server orchestrator.

use std::sync::Arc;
use tempfile::TempDir;
use tidesync_engine::protocol::{
    ConflictResolutionPolicy, DataType, SyncColumn, SyncParameters, SyncRelation, SyncSetup,
    SyncTable, SyncType, SyncValue,
};
use tidesync_engine::{
    BatchInfo, CancellationToken, ConflictingSetupAction, MemoryProvider, RoundContext,
    ServerOrchestrator, SetupConflict, SyncAgent, SyncError, SyncOptions, SyncProvider,
};
use uuid::Uuid;

fn category() -> SyncTable {
    SyncTable::new("Category")
        .with_column(SyncColumn::new("id", DataType::Integer))
        .with_column(SyncColumn::new("title", DataType::Text))
        .with_primary_key("id")
}

fn product() -> SyncTable {
    SyncTable::new("Product")
        .with_column(SyncColumn::new("id", DataType::Integer))
        .with_column(SyncColumn::new("name", DataType::Text))
        .with_column(SyncColumn::new("category_id", DataType::Integer).nullable())
        .with_primary_key("id")
}

fn server_db() -> MemoryProvider {
    MemoryProvider::new("server")
        .with_table(category())
        .with_table(product())
        .with_relation(SyncRelation::new(
            "fk_product_category",
            "Category",
            "id",
            "Product",
            "category_id",
        ))
}

fn setup() -> SyncSetup {
    // children listed first on purpose, apply order comes from relations
    SyncSetup::new(["Product", "Category"])
}

fn options(dir: &TempDir) -> SyncOptions {
    SyncOptions::new()
        .with_batch_directory(dir.path().join("batches"))
        .with_snapshots_directory(dir.path().join("snapshots"))
}

type Server = ServerOrchestrator<MemoryProvider>;
type Agent = SyncAgent<MemoryProvider, Server>;

fn agent(server: &Arc<Server>, client_db: &MemoryProvider, options: SyncOptions) -> Agent {
    SyncAgent::new(
        Arc::new(client_db.clone()),
        Arc::clone(server),
        setup(),
        options,
    )
}

async fn sync(agent: &Agent) -> tidesync_engine::Result<tidesync_engine::SyncResult> {
    agent
        .synchronize(
            None,
            SyncType::Normal,
            &SyncParameters::new(),
            None,
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn rows_flow_between_two_clients() {
    let dir = TempDir::new().unwrap();
    let server_db = server_db();
    let server = Arc::new(ServerOrchestrator::new(
        Arc::new(server_db.clone()),
        setup(),
        options(&dir),
    ));
    let alice_db = MemoryProvider::new("alice");
    let bob_db = MemoryProvider::new("bob");
    let alice = agent(&server, &alice_db, options(&dir));
    let bob = agent(&server, &bob_db, options(&dir));

    sync(&alice).await.unwrap();
    sync(&bob).await.unwrap();

    alice_db
        .insert("Category", vec![1.into(), "Lighting".into()])
        .unwrap();
    alice_db
        .insert("Product", vec![10.into(), "Lamp".into(), 1.into()])
        .unwrap();
    let up = sync(&alice).await.unwrap();
    assert_eq!(up.total_changes_uploaded, 2);
    assert_eq!(up.total_changes_applied_on_server, 2);

    let down = sync(&bob).await.unwrap();
    assert_eq!(down.total_changes_downloaded, 2);
    assert_eq!(
        bob_db.row("Product", &[10.into()]).unwrap()[1],
        SyncValue::from("Lamp")
    );

    // a clean round leaves nothing to exchange
    let again = sync(&bob).await.unwrap();
    assert_eq!(again.total_changes_uploaded, 0);
    assert_eq!(again.total_changes_downloaded, 0);
    let again = sync(&alice).await.unwrap();
    assert_eq!(again.total_changes_downloaded, 0);

    // deletes travel as tombstones, children before parents
    bob_db.delete("Product", &[10.into()]).unwrap();
    bob_db.delete("Category", &[1.into()]).unwrap();
    sync(&bob).await.unwrap();
    let result = sync(&alice).await.unwrap();
    assert_eq!(result.total_changes_downloaded, 2);
    assert_eq!(result.total_failed_rows, 0);
    assert_eq!(alice_db.row_count("Product"), 0);
    assert_eq!(alice_db.row_count("Category"), 0);
    assert_eq!(server_db.row_count("Category"), 0);
}

#[tokio::test]
async fn concurrent_updates_follow_the_policy() {
    for (policy, expected) in [
        (ConflictResolutionPolicy::ServerWins, "Server lamp"),
        (ConflictResolutionPolicy::ClientWins, "Client lamp"),
    ] {
        let dir = TempDir::new().unwrap();
        let server_db = server_db();
        server_db
            .insert("Product", vec![1.into(), "Lamp".into(), SyncValue::Null])
            .unwrap();
        let server = Arc::new(ServerOrchestrator::new(
            Arc::new(server_db.clone()),
            setup(),
            options(&dir),
        ));
        let client_db = MemoryProvider::new("client");
        let client = agent(
            &server,
            &client_db,
            options(&dir).with_conflict_resolution_policy(policy),
        );
        sync(&client).await.unwrap();

        client_db
            .upsert("Product", vec![1.into(), "Client lamp".into(), SyncValue::Null])
            .unwrap();
        server_db
            .upsert("Product", vec![1.into(), "Server lamp".into(), SyncValue::Null])
            .unwrap();

        let result = sync(&client).await.unwrap();
        assert!(result.total_resolved_conflicts >= 1, "{policy:?}");
        assert_eq!(
            server_db.row("Product", &[1.into()]).unwrap()[1],
            SyncValue::from(expected),
            "{policy:?}"
        );
        assert_eq!(
            client_db.row("Product", &[1.into()]).unwrap()[1],
            SyncValue::from(expected),
            "{policy:?}"
        );

        let settled = sync(&client).await.unwrap();
        assert_eq!(settled.total_changes_downloaded, 0, "{policy:?}");
        assert_eq!(settled.total_changes_uploaded, 0, "{policy:?}");
    }
}

#[tokio::test]
async fn large_downloads_are_split_into_parts() {
    let dir = TempDir::new().unwrap();
    let server_db = MemoryProvider::new("server").with_table(category());
    for id in 0..25_000i64 {
        server_db
            .insert("Category", vec![id.into(), format!("c{id}").into()])
            .unwrap();
    }
    let server = Arc::new(ServerOrchestrator::new(
        Arc::new(server_db.clone()),
        SyncSetup::new(["Category"]),
        options(&dir).with_batch_size(10_000),
    ));

    let context = RoundContext {
        scope_name: "DefaultScope".into(),
        client_scope_id: Uuid::new_v4(),
        sync_type: SyncType::Normal,
        server_timestamp: None,
        parameters: SyncParameters::new(),
        conflict_policy: ConflictResolutionPolicy::ServerWins,
    };
    let changes = server
        .apply_then_get_changes_sync(&context, &BatchInfo::empty())
        .unwrap();
    assert!(!changes.batch.is_in_memory());
    let counts: Vec<usize> = changes
        .batch
        .parts_info()
        .iter()
        .map(|p| p.row_count)
        .collect();
    assert_eq!(counts, vec![10_000, 10_000, 5_000]);
    let files = std::fs::read_dir(changes.batch.directory().unwrap())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .map(|e| e.path().extension().is_some_and(|x| x == "batch"))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(files, 3);

    let client_db = MemoryProvider::new("client");
    let client = SyncAgent::new(
        Arc::new(client_db.clone()),
        Arc::clone(&server),
        SyncSetup::new(["Category"]),
        options(&dir).with_batch_size(10_000),
    );
    let result = sync_plain(&client).await;
    assert_eq!(result.total_changes_applied_on_client, 25_000);
    assert_eq!(client_db.row_count("Category"), 25_000);
}

async fn sync_plain(agent: &Agent) -> tidesync_engine::SyncResult {
    sync(agent).await.unwrap()
}

#[tokio::test]
async fn aborted_setup_conflict_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let server_db = server_db();
    let client_db = MemoryProvider::new("client");

    let narrow = Arc::new(ServerOrchestrator::new(
        Arc::new(server_db.clone()),
        SyncSetup::new(["Category"]),
        options(&dir),
    ));
    let client = SyncAgent::new(
        Arc::new(client_db.clone()),
        narrow,
        SyncSetup::new(["Category"]),
        options(&dir),
    );
    sync_generic(&client).await.unwrap();

    let conn = client_db.open().unwrap();
    let before = client.local().load_scope(&conn, "DefaultScope").unwrap();

    server_db
        .insert("Product", vec![1.into(), "Lamp".into(), SyncValue::Null])
        .unwrap();
    let wide = Arc::new(ServerOrchestrator::new(
        Arc::new(server_db.clone()),
        setup(),
        options(&dir),
    ));
    let client = SyncAgent::new(Arc::new(client_db.clone()), wide, setup(), options(&dir))
        .with_setup_strategy(Arc::new(|conflict: &SetupConflict| {
            assert_eq!(conflict.local_setup.tables.len(), 1);
            ConflictingSetupAction::Abort
        }));
    let err = sync_generic(&client).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::SetupConflict { .. }));

    let after = client.local().load_scope(&conn, "DefaultScope").unwrap();
    assert_eq!(after.last_sync_timestamp, before.last_sync_timestamp);
    assert_eq!(after.last_server_sync_timestamp, before.last_server_sync_timestamp);
    assert!(!client_db.has_table("Product"));
}

async fn sync_generic<R: tidesync_engine::RemoteOrchestrator>(
    agent: &SyncAgent<MemoryProvider, R>,
) -> tidesync_engine::Result<tidesync_engine::SyncResult> {
    agent
        .synchronize(
            None,
            SyncType::Normal,
            &SyncParameters::new(),
            None,
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn tenants_share_a_server_without_interference() {
    let dir = TempDir::new().unwrap();
    let server_db = server_db();
    server_db
        .insert("Category", vec![1.into(), "Shared".into()])
        .unwrap();
    let server = Arc::new(ServerOrchestrator::new(
        Arc::new(server_db.clone()),
        setup(),
        options(&dir),
    ));

    let a_db = MemoryProvider::new("tenant-a");
    let b_db = MemoryProvider::new("tenant-b");
    let a = agent(&server, &a_db, options(&dir));
    let b = agent(&server, &b_db, options(&dir));
    let token = CancellationToken::new();
    let parameters = SyncParameters::new();

    let (ra, rb) = tokio::join!(
        a.synchronize(Some("tenant-A"), SyncType::Normal, &parameters, None, &token),
        b.synchronize(Some("tenant-B"), SyncType::Normal, &parameters, None, &token),
    );
    assert_eq!(ra.unwrap().total_changes_downloaded, 1);
    assert_eq!(rb.unwrap().total_changes_downloaded, 1);

    a_db.insert("Category", vec![2.into(), "From A".into()])
        .unwrap();
    let (ra, rb) = tokio::join!(
        a.synchronize(Some("tenant-A"), SyncType::Normal, &parameters, None, &token),
        b.synchronize(Some("tenant-B"), SyncType::Normal, &parameters, None, &token),
    );
    assert_eq!(ra.unwrap().total_changes_uploaded, 1);
    rb.unwrap();
    b.synchronize(Some("tenant-B"), SyncType::Normal, &parameters, None, &token)
        .await
        .unwrap();
    assert!(b_db.row("Category", &[2.into()]).is_some());
}

#[tokio::test]
async fn unique_violations_fail_rows_not_rounds() {
    let dir = TempDir::new().unwrap();
    let server_db = MemoryProvider::new("server")
        .with_table(category())
        .with_unique("Category", "title");
    server_db
        .insert("Category", vec![1.into(), "Lighting".into()])
        .unwrap();
    let server = Arc::new(ServerOrchestrator::new(
        Arc::new(server_db.clone()),
        SyncSetup::new(["Category"]),
        options(&dir),
    ));
    let client_db = MemoryProvider::new("client");
    let client = SyncAgent::new(
        Arc::new(client_db.clone()),
        Arc::clone(&server),
        SyncSetup::new(["Category"]),
        options(&dir),
    );
    sync_generic(&client).await.unwrap();

    client_db
        .insert("Category", vec![2.into(), "Lighting".into()])
        .unwrap();
    client_db
        .insert("Category", vec![3.into(), "Seating".into()])
        .unwrap();
    let result = sync_generic(&client).await.unwrap();
    assert_eq!(result.total_changes_uploaded, 2);
    assert_eq!(result.total_changes_applied_on_server, 1);
    assert_eq!(result.total_failed_rows, 1);
    assert!(server_db.row("Category", &[3.into()]).is_some());
    assert!(server_db.row("Category", &[2.into()]).is_none());
}

#[tokio::test]
async fn watermarks_only_move_forward() {
    let dir = TempDir::new().unwrap();
    let server_db = server_db();
    let server = Arc::new(ServerOrchestrator::new(
        Arc::new(server_db.clone()),
        setup(),
        options(&dir),
    ));
    let client_db = MemoryProvider::new("client");
    let client = agent(&server, &client_db, options(&dir));
    let conn = client_db.open().unwrap();
    sync(&client).await.unwrap();

    let mut previous = None;
    for round in 0..3i64 {
        server_db
            .insert("Category", vec![round.into(), format!("c{round}").into()])
            .unwrap();
        client_db
            .insert("Category", vec![(100 + round).into(), format!("l{round}").into()])
            .unwrap();
        sync(&client).await.unwrap();
        let scope = client.local().load_scope(&conn, "DefaultScope").unwrap();
        let current = (scope.last_sync_timestamp, scope.last_server_sync_timestamp);
        if let Some((local, remote)) = previous {
            assert!(current.0 >= local);
            assert!(current.1 >= remote);
        }
        previous = Some(current);
    }
    assert_eq!(client_db.row_count("Category"), 6);
    assert_eq!(server_db.row_count("Category"), 6);
}
