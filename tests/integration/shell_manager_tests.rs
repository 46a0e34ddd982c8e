//! Lazy creation and replacement of the shared shell session.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use agent_shell::shell::ShellManager;

use super::test_helpers::shell_config;

#[tokio::test]
async fn session_is_created_on_first_use_and_reused() {
    let manager = ShellManager::new(shell_config());

    let first = manager.session().await.unwrap();
    let again = manager.session().await.unwrap();
    assert!(Arc::ptr_eq(&first, &again), "live session is reused");

    let out = manager.exec("echo managed", None, None).await.unwrap();
    assert_eq!(out.stdout, "managed\n");

    manager.shutdown().await;
    assert!(!first.is_alive());
}

/// A dead session is replaced transparently on next use.
#[tokio::test]
async fn dead_session_is_replaced() {
    let manager = ShellManager::new(shell_config());
    let first = manager.session().await.unwrap();

    let died = tokio::time::timeout(Duration::from_secs(10), manager.exec("exit 0", None, None))
        .await
        .expect("exec returns once the shell is gone");
    assert!(died.is_err());
    assert!(!first.is_alive());

    let out = manager.exec("echo reborn", None, None).await.unwrap();
    assert_eq!(out.stdout, "reborn\n");

    let second = manager.session().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_ne!(first.pid(), second.pid());

    manager.shutdown().await;
}

#[tokio::test]
async fn pwd_and_set_cwd_go_through_live_session() {
    let manager = ShellManager::new(shell_config());
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().canonicalize().unwrap();

    assert_eq!(manager.set_cwd(&target).await.unwrap(), target);
    assert_eq!(manager.pwd().await.unwrap(), target);

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_without_session_is_noop() {
    let manager = ShellManager::new(shell_config());
    manager.shutdown().await;
}
