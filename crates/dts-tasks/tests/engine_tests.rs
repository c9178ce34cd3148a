//! End-to-end scenarios for the transfer task engine, driven against local
//! directory endpoints in temporary directories.

use dts_core::{
    Database, DatabaseConfig, DtsError, Endpoint, Registry, TransferStatus, TransferStatusCode,
};
use dts_db::LocalDatabase;
use dts_endpoints::LocalEndpoint;
use dts_tasks::{
    SupervisorOptions, TaskClient, TaskSupervisor, TransferRequest, TransferTask, checkpoint,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use uuid::Uuid;

const ORCID: &str = "0000-0000-1234-0000";

struct Fixture {
    source_dir: TempDir,
    destination_dir: TempDir,
    staging_dir: TempDir,
    data_dir: TempDir,
}

impl Fixture {
    fn new(files: &[(&str, &str)]) -> Self {
        let fixture = Self {
            source_dir: TempDir::new().unwrap(),
            destination_dir: TempDir::new().unwrap(),
            staging_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
        };
        for (name, contents) in files {
            std::fs::write(fixture.source_dir.path().join(name), contents).unwrap();
        }
        fixture
    }

    /// Build the registry around fresh endpoint instances. Reusing one set
    /// of components across supervisor restarts keeps transfer handles
    /// alive, the way a service restart leaves remote endpoints running.
    fn components(&self) -> (Arc<Registry>, Arc<dyn Endpoint>) {
        let source: Arc<dyn Endpoint> = Arc::new(
            LocalEndpoint::new("foo", self.source_dir.path().to_path_buf()).unwrap(),
        );
        let destination: Arc<dyn Endpoint> = Arc::new(
            LocalEndpoint::new("bar", self.destination_dir.path().to_path_buf()).unwrap(),
        );
        let local: Arc<dyn Endpoint> = Arc::new(
            LocalEndpoint::new("manifests", self.staging_dir.path().to_path_buf()).unwrap(),
        );

        let mut registry = Registry::new();
        registry.add_endpoint("foo", source.clone());
        registry.add_endpoint("bar", destination.clone());
        registry.add_endpoint("manifests", local.clone());
        registry.add_database(
            "db-foo",
            Arc::new(LocalDatabase::new(&DatabaseConfig::default(), source, None)),
        );
        registry.add_database(
            "db-bar",
            Arc::new(LocalDatabase::new(
                &DatabaseConfig::default(),
                destination,
                None,
            )),
        );
        (Arc::new(registry), local)
    }

    fn options(&self, poll_ms: u64) -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_millis(poll_ms),
            delete_after: Duration::from_secs(3600),
            data_dir: self.data_dir.path().to_path_buf(),
        }
    }

    async fn spawn(&self, poll_ms: u64) -> (TaskClient, JoinHandle<()>) {
        let (registry, local) = self.components();
        TaskSupervisor::spawn(self.options(poll_ms), registry, local).await
    }

    fn request(&self, file_ids: &[&str]) -> TransferRequest {
        TransferRequest {
            orcid: ORCID.into(),
            source: "db-foo".into(),
            destination: "db-bar".into(),
            file_ids: file_ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    fn destination_path(&self, id: Uuid, name: &str) -> std::path::PathBuf {
        self.destination_dir.path().join(format!("dts/dts-{id}/{name}"))
    }

    fn staged_manifest_count(&self) -> usize {
        std::fs::read_dir(self.staging_dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("manifest.")
            })
            .count()
    }
}

async fn wait_terminal(client: &TaskClient, id: Uuid) -> TransferStatus {
    for _ in 0..1000 {
        let status = client.status(id).await.unwrap();
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} did not reach a terminal status");
}

fn rank(code: TransferStatusCode) -> u8 {
    match code {
        TransferStatusCode::Unknown => 0,
        TransferStatusCode::Staging => 1,
        TransferStatusCode::Active | TransferStatusCode::Inactive => 2,
        TransferStatusCode::Finalizing => 3,
        TransferStatusCode::Succeeded | TransferStatusCode::Failed => 4,
    }
}

#[tokio::test]
async fn test_happy_path_delivers_payload_and_manifest() {
    let fixture = Fixture::new(&[("file1.txt", "alpha"), ("file2.txt", "beta")]);
    let (client, handle) = fixture.spawn(20).await;

    let id = client
        .create(fixture.request(&["file1.txt", "file2.txt"]))
        .await
        .unwrap();

    // Status codes must be monotone on the way to the terminal state
    let mut observed = Vec::new();
    let status = loop {
        let status = client.status(id).await.unwrap();
        observed.push(status.code);
        if status.is_terminal() {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(observed.windows(2).all(|pair| rank(pair[0]) <= rank(pair[1])));

    assert_eq!(status.code, TransferStatusCode::Succeeded);
    assert_eq!(status.num_files, 2);
    assert_eq!(status.num_files_transferred, 2);
    assert_eq!(status.num_files_skipped, 0);

    let copied = std::fs::read_to_string(fixture.destination_path(id, "file1.txt")).unwrap();
    assert_eq!(copied, "alpha");
    assert!(fixture.destination_path(id, "file2.txt").exists());

    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fixture.destination_path(id, "manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["name"], "manifest");
    let resources = manifest["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0]["id"], "file1.txt");
    assert_eq!(resources[1]["id"], "file2.txt");

    // The staged manifest is removed once its delivery is terminal
    assert_eq!(fixture.staged_manifest_count(), 0);

    client.stop().await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_create_then_status_is_immediately_answerable() {
    let fixture = Fixture::new(&[("file1.txt", "alpha")]);
    let (client, _handle) = fixture.spawn(1000).await;

    let id = client.create(fixture.request(&["file1.txt"])).await.unwrap();
    let status = client.status(id).await.unwrap();
    assert_ne!(status.code, TransferStatusCode::Unknown);
    assert_eq!(status.num_files, 1);
}

#[tokio::test]
async fn test_missing_source_file_fails_whole_task() {
    let fixture = Fixture::new(&[("file1.txt", "alpha")]);
    let (client, _handle) = fixture.spawn(20).await;

    let id = client
        .create(fixture.request(&["nonexistent.txt", "file1.txt"]))
        .await
        .unwrap();
    let status = wait_terminal(&client, id).await;

    assert_eq!(status.code, TransferStatusCode::Failed);
    assert!(
        status
            .message
            .as_deref()
            .unwrap()
            .contains("resource resolution failed")
    );
    assert!(!fixture.destination_dir.path().join("dts").exists());
}

#[tokio::test]
async fn test_create_validation() {
    let fixture = Fixture::new(&[("file1.txt", "alpha")]);
    let (client, _handle) = fixture.spawn(1000).await;

    let mut empty = fixture.request(&[]);
    empty.file_ids.clear();
    assert!(matches!(
        client.create(empty).await.unwrap_err(),
        DtsError::InvalidRequest(_)
    ));

    let mut unknown = fixture.request(&["file1.txt"]);
    unknown.source = "db-nope".into();
    assert!(matches!(
        client.create(unknown).await.unwrap_err(),
        DtsError::InvalidRequest(_)
    ));

    assert!(matches!(
        client.status(Uuid::new_v4()).await.unwrap_err(),
        DtsError::TaskNotFound(_)
    ));
}

#[tokio::test]
async fn test_cancel_before_transfer_starts() {
    let fixture = Fixture::new(&[
        ("file1.txt", "alpha"),
        ("file2.txt", "beta"),
        ("file3.txt", "gamma"),
    ]);
    // Slow poll: the cancel lands before the task leaves the gate
    let (client, _handle) = fixture.spawn(500).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = client
        .create(fixture.request(&["file1.txt", "file2.txt", "file3.txt"]))
        .await
        .unwrap();

    let reply = client.cancel(id).await.unwrap();
    assert!(!reply.is_terminal());

    // A second cancel is a no-op unless the first already finished
    match client.cancel(id).await {
        Ok(status) => assert!(!status.is_terminal()),
        Err(DtsError::TaskAlreadyTerminal(_)) => {}
        Err(e) => panic!("unexpected cancel error: {e}"),
    }

    let status = wait_terminal(&client, id).await;
    assert_eq!(status.code, TransferStatusCode::Failed);
    assert_eq!(status.num_files_transferred + status.num_files_skipped, 3);

    // Canceling a terminal task is rejected
    assert!(matches!(
        client.cancel(id).await.unwrap_err(),
        DtsError::TaskAlreadyTerminal(_)
    ));
}

#[tokio::test]
async fn test_cancel_during_finalizing_keeps_payload_counts() {
    let fixture = Fixture::new(&[
        ("file1.txt", "alpha"),
        ("file2.txt", "beta"),
        ("file3.txt", "gamma"),
    ]);
    // A long-ish poll keeps the task in Finalizing for a whole tick, which
    // gives the cancel a deterministic window after the payload has landed
    let (client, _handle) = fixture.spawn(150).await;

    let id = client
        .create(fixture.request(&["file1.txt", "file2.txt", "file3.txt"]))
        .await
        .unwrap();

    loop {
        let status = client.status(id).await.unwrap();
        if status.code == TransferStatusCode::Finalizing {
            break;
        }
        assert!(!status.is_terminal(), "task finished before Finalizing was observed");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    client.cancel(id).await.unwrap();

    let status = wait_terminal(&client, id).await;
    // The payload fully landed before the cancel; only the single-file
    // manifest delivery was canceled, and its counters must not leak into
    // the task's file counts
    assert_eq!(status.num_files, 3);
    assert_eq!(status.num_files_transferred, 3);
    assert_eq!(status.num_files_skipped, 0);
    for name in ["file1.txt", "file2.txt", "file3.txt"] {
        assert!(fixture.destination_path(id, name).exists());
    }

    // The staged manifest is cleaned up whichever way the delivery ended
    assert_eq!(fixture.staged_manifest_count(), 0);
}

#[tokio::test]
async fn test_five_concurrent_transfers_one_canceled() {
    let fixture = Fixture::new(&[("file1.txt", "alpha"), ("file2.txt", "beta")]);
    let (client, _handle) = fixture.spawn(200).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            client
                .create(fixture.request(&["file1.txt", "file2.txt"]))
                .await
                .unwrap(),
        );
    }
    let distinct: HashSet<Uuid> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 5);

    let canceled = ids[4];
    client.cancel(canceled).await.unwrap();

    for &id in &ids {
        let status = wait_terminal(&client, id).await;
        if id == canceled {
            assert_eq!(status.code, TransferStatusCode::Failed);
        } else {
            assert_eq!(status.code, TransferStatusCode::Succeeded);
            assert!(fixture.destination_path(id, "file1.txt").exists());
            assert!(fixture.destination_path(id, "file2.txt").exists());
            assert!(fixture.destination_path(id, "manifest.json").exists());
        }
    }
    assert!(!fixture
        .destination_path(canceled, "manifest.json")
        .exists());
}

#[tokio::test]
async fn test_stop_checkpoints_and_restart_resumes() {
    let fixture = Fixture::new(&[("file1.txt", "alpha")]);
    let (registry, local) = fixture.components();

    let (client, handle) =
        TaskSupervisor::spawn(fixture.options(50), registry.clone(), local.clone()).await;
    let id = client.create(fixture.request(&["file1.txt"])).await.unwrap();

    // Give the supervisor a tick or two, then stop mid-flight
    tokio::time::sleep(Duration::from_millis(60)).await;
    client.stop().await.unwrap();
    handle.await.unwrap();

    // Same endpoints, new supervisor: the task must be reachable and finish
    let (client, handle) = TaskSupervisor::spawn(fixture.options(20), registry, local).await;
    let resumed = client.status(id).await.unwrap();
    assert_ne!(resumed.code, TransferStatusCode::Unknown);

    let status = wait_terminal(&client, id).await;
    assert_eq!(status.code, TransferStatusCode::Succeeded);
    assert!(fixture.destination_path(id, "manifest.json").exists());

    client.stop().await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_preserves_nonterminal_tasks() {
    let fixture = Fixture::new(&[("file1.txt", "alpha")]);
    // Poll far in the future so the tasks stay queued
    let (client, handle) = fixture.spawn(60_000).await;

    let first = client.create(fixture.request(&["file1.txt"])).await.unwrap();
    let second = client.create(fixture.request(&["file1.txt"])).await.unwrap();
    client.stop().await.unwrap();
    handle.await.unwrap();

    let tasks =
        checkpoint::load(&checkpoint::checkpoint_path(fixture.data_dir.path())).await;
    assert_eq!(tasks.len(), 2);
    for id in [first, second] {
        let task = &tasks[&id];
        assert_eq!(task.source, "db-foo");
        assert_eq!(task.destination, "db-bar");
        assert_eq!(task.file_ids, vec!["file1.txt".to_string()]);
        assert_eq!(task.status.code, TransferStatusCode::Staging);
        // At most one sub-operation handle may ever be recorded
        let handles = [
            task.staging.is_some(),
            task.payload_transfer.is_some(),
            task.manifest_transfer.is_some(),
        ];
        assert!(handles.iter().filter(|set| **set).count() <= 1);
    }
}

#[tokio::test]
async fn test_unrecognized_handle_after_restart_fails_task() {
    let fixture = Fixture::new(&[("file1.txt", "alpha")]);

    // Hand-craft a checkpoint describing a task mid-payload whose endpoint
    // handle no longer exists anywhere.
    let mut task = TransferTask::new(ORCID, "db-foo", "db-bar", vec!["file1.txt".into()]);
    let resources = {
        let (registry, _local) = fixture.components();
        registry
            .database("db-foo")
            .unwrap()
            .resources(&task.file_ids)
            .await
            .unwrap()
    };
    task.resources = Some(resources);
    task.payload_transfer = Some(Uuid::new_v4());
    task.status.code = TransferStatusCode::Active;
    let id = task.id;

    let mut tasks = std::collections::HashMap::new();
    tasks.insert(id, task);
    checkpoint::save(
        &tasks,
        &checkpoint::checkpoint_path(fixture.data_dir.path()),
    )
    .await
    .unwrap();

    let (client, _handle) = fixture.spawn(20).await;
    let status = wait_terminal(&client, id).await;
    assert_eq!(status.code, TransferStatusCode::Failed);
    assert!(status.message.as_deref().unwrap().contains("resume failed"));
}

#[tokio::test]
async fn test_completed_tasks_expire_after_retention() {
    let fixture = Fixture::new(&[("file1.txt", "alpha")]);
    let (registry, local) = fixture.components();
    let options = SupervisorOptions {
        poll_interval: Duration::from_millis(20),
        delete_after: Duration::ZERO,
        data_dir: fixture.data_dir.path().to_path_buf(),
    };
    let (client, _handle) = TaskSupervisor::spawn(options, registry, local).await;

    let id = client.create(fixture.request(&["file1.txt"])).await.unwrap();
    wait_terminal(&client, id).await;

    // The next poll after completion garbage-collects the task
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        client.status(id).await.unwrap_err(),
        DtsError::TaskNotFound(_)
    ));
}
