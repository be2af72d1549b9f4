//! Lifecycle manager against the in-memory runtime

mod support;

use codebox_common::{CodeboxError, OwnerId};
use codebox_executor::lifecycle::{LABEL_INSTANCE_ID, LABEL_OWNER_ID};
use codebox_executor::runtime::ContainerRuntime;
use support::{
    engine_tar, engine_tar_with_links, entry_kinds, file_names, manager, MemoryStore, MockRuntime,
};
use tar::EntryType;

const CHOWN: &str = "chown -R coder:coder /home/coder/project";

#[tokio::test]
async fn test_ensure_running_creates_and_prepares_once() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    store
        .put_snapshot(owner, engine_tar(&[("main.py", "print(1)")]))
        .await;
    let manager = manager(&runtime, &store);

    let first = manager.ensure_running(&owner).await.unwrap();
    assert!(first.created);
    assert_eq!(first.url, format!("http://ide.test/ide/{owner}/"));

    let second = manager.ensure_running(&owner).await.unwrap();
    assert!(!second.created);
    assert_eq!(first.container_id, second.container_id);

    let state = runtime.state.lock().await;
    assert_eq!(state.created, 1);
    // snapshot copied in and ownership fixed exactly once
    assert_eq!(
        state.copied_in,
        vec![(first.container_id.clone(), "/home/coder/project".to_string())]
    );
    let chowns: Vec<_> = state
        .execs
        .iter()
        .filter(|(_, cmd, _)| cmd.join(" ") == CHOWN)
        .collect();
    assert_eq!(chowns.len(), 1);
    assert_eq!(chowns[0].2, "root");

    let container = &state.containers[&first.container_id];
    assert_eq!(container.spec.image, "codebox/ide:test");
    assert_eq!(container.spec.labels[LABEL_OWNER_ID], owner.to_string());
    assert_eq!(container.spec.labels[LABEL_INSTANCE_ID], "default");
    assert_eq!(container.spec.cap_add, vec!["SYS_PTRACE".to_string()]);
    assert_eq!(container.spec.nano_cpus, 1_000_000_000);
    assert_eq!(container.networks, vec!["proxy".to_string()]);
}

#[tokio::test]
async fn test_new_owner_without_snapshot() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let manager = manager(&runtime, &store);

    let handle = manager.ensure_running(&OwnerId::new()).await.unwrap();
    assert!(handle.created);

    let state = runtime.state.lock().await;
    assert!(state.copied_in.is_empty());
    assert_eq!(state.execs.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_running_creates_one_container() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let manager = manager(&runtime, &store);
    let owner = OwnerId::new();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_running(&owner).await })
        })
        .collect();

    let mut ids = Vec::new();
    let mut created = 0;
    for task in tasks {
        let handle = task.await.unwrap().unwrap();
        if handle.created {
            created += 1;
        }
        ids.push(handle.container_id);
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);
    assert_eq!(runtime.created().await, 1);
    assert_eq!(runtime.live_containers().await, 1);
    assert_eq!(manager.tracked_owners(), 0);
}

#[tokio::test]
async fn test_different_owners_get_different_containers() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let manager = manager(&runtime, &store);

    let a = manager.ensure_running(&OwnerId::new()).await.unwrap();
    let b = manager.ensure_running(&OwnerId::new()).await.unwrap();
    assert_ne!(a.container_id, b.container_id);
    assert_eq!(runtime.created().await, 2);
}

#[tokio::test]
async fn test_stopped_container_is_restarted_without_preparation() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    store.put_snapshot(owner, engine_tar(&[("a.txt", "a")])).await;
    let manager = manager(&runtime, &store);

    let first = manager.ensure_running(&owner).await.unwrap();
    runtime.stop(&first.container_id).await;

    let again = manager.ensure_running(&owner).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.container_id, first.container_id);
    assert!(runtime.is_running(&first.container_id).await);

    let state = runtime.state.lock().await;
    assert_eq!(state.created, 1);
    assert_eq!(state.copied_in.len(), 1);
    assert_eq!(state.execs.len(), 1);
}

#[tokio::test]
async fn test_containers_of_other_instances_are_ignored() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    let foreign = runtime
        .insert_container(
            &[
                (LABEL_OWNER_ID, &owner.to_string()),
                (LABEL_INSTANCE_ID, "other-installation"),
            ],
            true,
        )
        .await;
    let manager = manager(&runtime, &store);

    let handle = manager.ensure_running(&owner).await.unwrap();
    assert!(handle.created);
    assert_ne!(handle.container_id, foreign);
}

#[tokio::test]
async fn test_failed_chown_is_reported() {
    let runtime = MockRuntime::new();
    runtime
        .set_exec_response(CHOWN, "chown: invalid user: 'coder:coder'", 1)
        .await;
    let store = MemoryStore::default();
    let manager = manager(&runtime, &store);

    let err = manager.ensure_running(&OwnerId::new()).await.unwrap_err();
    match err {
        CodeboxError::CommandExecutionFailed {
            command,
            exit_code,
            output,
        } => {
            assert_eq!(command, CHOWN);
            assert_eq!(exit_code, 1);
            assert!(output.contains("invalid user"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_preparation_discards_container() {
    let runtime = MockRuntime::new();
    runtime.set_exec_response(CHOWN, "chown: invalid user", 1).await;
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    store
        .put_snapshot(owner, engine_tar(&[("main.py", "print(1)")]))
        .await;
    let manager = manager(&runtime, &store);

    assert!(manager.ensure_running(&owner).await.is_err());
    assert_eq!(runtime.live_containers().await, 0);

    // the retry starts over with a fresh container and prepares it
    runtime.set_exec_response(CHOWN, "", 0).await;
    let handle = manager.ensure_running(&owner).await.unwrap();
    assert!(handle.created);

    let state = runtime.state.lock().await;
    assert_eq!(state.created, 2);
    assert_eq!(state.containers.len(), 1);
    let prepared: Vec<_> = state
        .execs
        .iter()
        .filter(|(id, cmd, _)| id == &handle.container_id && cmd.join(" ") == CHOWN)
        .collect();
    assert_eq!(prepared.len(), 1);
    assert!(state
        .copied_in
        .iter()
        .any(|(id, _)| id == &handle.container_id));
}

#[tokio::test]
async fn test_failed_copy_in_keeps_snapshot() {
    let runtime = MockRuntime::new();
    runtime.update(|s| s.fail_copy_in = true).await;
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    let snapshot = engine_tar(&[("main.py", "print(1)")]);
    store.put_snapshot(owner, snapshot.clone()).await;
    let manager = manager(&runtime, &store);

    manager.ensure_running(&owner).await.unwrap_err();
    assert_eq!(runtime.live_containers().await, 0);
    // nothing left behind that a later flush could save over the snapshot
    assert!(manager.find_container(&owner).await.unwrap().is_none());
    assert!(matches!(
        manager.save_files(&owner).await,
        Err(CodeboxError::ContainerNotFound(_))
    ));
    assert_eq!(store.snapshot(&owner).await, Some(snapshot));
}

#[tokio::test]
async fn test_exec_without_failing_on_non_zero() {
    let runtime = MockRuntime::new();
    runtime.set_exec_response("false", "nope", 1).await;
    let store = MemoryStore::default();
    let manager = manager(&runtime, &store);
    let handle = manager.ensure_running(&OwnerId::new()).await.unwrap();

    let output = manager
        .exec_in_container(&handle.container_id, &["false".to_string()], false)
        .await
        .unwrap();
    assert_eq!(output, b"nope");

    let err = manager
        .exec_in_container(&handle.container_id, &["false".to_string()], true)
        .await
        .unwrap_err();
    assert!(matches!(err, CodeboxError::CommandExecutionFailed { exit_code: 1, .. }));
}

#[tokio::test]
async fn test_flush_files_normalizes_names() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    let manager = manager(&runtime, &store);
    let handle = manager.ensure_running(&owner).await.unwrap();
    runtime
        .set_files(
            &handle.container_id,
            engine_tar(&[("main.py", "print(2)"), ("lib/util.py", "")]),
        )
        .await;

    let tar = manager.flush_files(&owner).await.unwrap();
    assert_eq!(file_names(&tar), vec!["main.py", "lib/util.py"]);
    // flushing alone persists nothing
    assert_eq!(store.saves().await, 0);

    manager.save_files(&owner).await.unwrap();
    assert_eq!(store.saves().await, 1);
    assert_eq!(store.snapshot(&owner).await, Some(tar));
}

#[tokio::test]
async fn test_flush_files_keeps_links() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    let manager = manager(&runtime, &store);
    let handle = manager.ensure_running(&owner).await.unwrap();
    runtime
        .set_files(
            &handle.container_id,
            engine_tar_with_links(
                &[("a.txt", "alpha")],
                &[
                    ("link-to-a", "a.txt", EntryType::Symlink),
                    ("hard-a", "./a.txt", EntryType::Link),
                ],
            ),
        )
        .await;

    let tar = manager.flush_files(&owner).await.unwrap();
    assert_eq!(
        entry_kinds(&tar),
        vec![
            ("a.txt".to_string(), EntryType::Regular, None),
            (
                "link-to-a".to_string(),
                EntryType::Symlink,
                Some("a.txt".to_string())
            ),
            ("hard-a".to_string(), EntryType::Link, Some("a.txt".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_flush_files_requires_running_container() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    let manager = manager(&runtime, &store);

    let err = manager.flush_files(&owner).await.unwrap_err();
    assert!(matches!(err, CodeboxError::ContainerNotFound(_)));

    let handle = manager.ensure_running(&owner).await.unwrap();
    runtime.stop(&handle.container_id).await;
    let err = manager.flush_files(&owner).await.unwrap_err();
    assert!(matches!(err, CodeboxError::ContainerNotFound(_)));
    // never creates one on its own
    assert_eq!(runtime.created().await, 1);
}

#[tokio::test]
async fn test_restore_files() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    let manager = manager(&runtime, &store);

    assert!(!manager.restore_files(&owner).await.unwrap());

    let handle = manager.ensure_running(&owner).await.unwrap();
    let uploaded = engine_tar(&[("uploaded.txt", "new")]);
    store.put_snapshot(owner, uploaded.clone()).await;

    assert!(manager.restore_files(&owner).await.unwrap());
    let files = runtime
        .copy_archive_out(&handle.container_id, "/home/coder/project")
        .await
        .unwrap();
    assert_eq!(files, uploaded);
}

#[tokio::test]
async fn test_stop_and_remove() {
    let runtime = MockRuntime::new();
    let store = MemoryStore::default();
    let owner = OwnerId::new();
    let manager = manager(&runtime, &store);
    let handle = manager.ensure_running(&owner).await.unwrap();

    manager.stop_and_remove(&handle.container_id).await.unwrap();
    assert_eq!(runtime.live_containers().await, 0);
    assert!(manager.find_container(&owner).await.unwrap().is_none());

    let err = manager
        .stop_and_remove(&handle.container_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CodeboxError::ContainerNotFound(_)));
}
