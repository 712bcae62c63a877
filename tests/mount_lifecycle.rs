//! Mount lifecycle tests against a scripted authority.
//!
//! These cover startup outcomes, teardown on failure, the exactly-once
//! unmount guarantee and the unmount escalation order.

mod common;

use common::{Call, MockAuthority, Ready, RecordingObserver, Script};
use mountkeeper::modules::constants::{FORCE_UNMOUNT_ATTEMPTS, FORCE_UNMOUNT_DELAY, MOUNT_TIMEOUT};
use mountkeeper::{AccessPolicy, MountController, MountError, Scope};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn controller(script: Script) -> (MountController<MockAuthority>, MockAuthority) {
    let authority = MockAuthority::new(script);
    (MountController::new(authority.clone()), authority)
}

fn blocks() -> Arc<String> {
    Arc::new("blocks".to_string())
}

#[tokio::test]
async fn test_mount_returns_serving_mount() {
    let (controller, authority) = controller(Script::default());
    let node = Scope::root("node");

    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "root").await);

    assert_eq!(mount.mount_point(), Path::new("/mnt/x"));
    assert_eq!(mount.policy(), AccessPolicy::AllowRoot);
    assert_eq!(mount.filesystem().as_str(), "blocks");
    assert!(!mount.is_closed());
    assert_eq!(node.child_count(), 1);
    assert_eq!(authority.calls(), vec![Call::Mount]);
    assert_eq!(authority.mountpoints(), vec![Path::new("/mnt/x").to_path_buf()]);

    assert_ok!(mount.unmount().await);
}

#[tokio::test]
async fn test_invalid_policy_makes_no_os_call() {
    let (controller, authority) = controller(Script::default());
    let node = Scope::root("node");

    let err = assert_err!(controller.mount(&node, blocks(), "/mnt/x", "bogus").await);

    assert!(matches!(err, MountError::InvalidConfiguration(_)));
    assert!(authority.calls().is_empty());
    assert_eq!(node.child_count(), 0);
}

#[tokio::test]
async fn test_mount_failure_skips_cleanup() {
    let (controller, authority) = controller(Script {
        mount_error: Some(libc::ENOENT),
        ..Script::default()
    });
    let node = Scope::root("node");

    let err = assert_err!(controller.mount(&node, blocks(), "/mnt/missing", "").await);

    match err {
        MountError::MountFailed { path, source } => {
            assert_eq!(path, Path::new("/mnt/missing"));
            assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(authority.calls(), vec![Call::Mount]);
    assert_eq!(node.child_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mount_timeout_cleans_up_once() {
    let (controller, authority) = controller(Script {
        ready: Ready::Never,
        ..Script::default()
    });
    let node = Scope::root("node");
    let started = tokio::time::Instant::now();

    let err = assert_err!(controller.mount(&node, blocks(), "/mnt/slow", "").await);

    assert!(matches!(err, MountError::MountTimeout { timeout, .. } if timeout == MOUNT_TIMEOUT));
    assert!(started.elapsed() >= MOUNT_TIMEOUT);
    assert_eq!(authority.unmount_calls(), 1);
    assert_eq!(authority.count(Call::Direct), 1);
    assert_eq!(node.child_count(), 0);
}

#[tokio::test]
async fn test_serve_failure_before_ready() {
    let (controller, authority) = controller(Script {
        ready: Ready::Never,
        serve_error: Some(libc::EIO),
        ..Script::default()
    });
    let node = Scope::root("node");

    let err = assert_err!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    match err {
        MountError::ServeFailed { source, .. } => assert_eq!(source.raw_os_error(), Some(libc::EIO)),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(authority.count(Call::Direct), 1);
    assert_eq!(node.child_count(), 0);
}

#[tokio::test]
async fn test_deferred_mount_error_is_reported() {
    let (controller, authority) = controller(Script {
        ready: Ready::WithError(libc::ENOTCONN),
        ..Script::default()
    });
    let node = Scope::root("node");

    let err = assert_err!(controller.mount(&node, blocks(), "/mnt/x", "other").await);

    match err {
        MountError::MountFailed { source, .. } => {
            assert_eq!(source.raw_os_error(), Some(libc::ENOTCONN))
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(authority.unmount_calls(), 1);
}

#[tokio::test]
async fn test_unmount_is_idempotent() {
    let (controller, authority) = controller(Script::default());
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    let first = mount.unmount().await;
    let second = mount.unmount().await;
    assert_ok!(node.close().await);

    assert!(first.is_ok() && second.is_ok());
    assert!(mount.is_closed());
    assert_eq!(authority.unmount_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_unmount_result_is_replayed() {
    let (controller, authority) = controller(Script {
        direct_ok: false,
        close_ok: false,
        force_succeeds_on: None,
        ..Script::default()
    });
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    let first = assert_err!(mount.unmount().await);
    let second = assert_err!(mount.unmount().await);

    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(authority.count(Call::Force), FORCE_UNMOUNT_ATTEMPTS);
}

#[tokio::test]
async fn test_concurrent_unmounts_share_one_attempt() {
    let (controller, authority) = controller(Script::default());
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    let (a, b, c) = tokio::join!(mount.unmount(), mount.unmount(), node.close());

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(authority.unmount_calls(), 1);
}

#[tokio::test]
async fn test_parent_close_unmounts_children() {
    let (controller, authority) = controller(Script::default());
    let node = Scope::root("node");
    let first = assert_ok!(controller.mount(&node, blocks(), "/mnt/a", "").await);
    let second = assert_ok!(controller.mount(&node, blocks(), "/mnt/b", "").await);

    assert_ok!(node.close().await);

    assert!(first.is_closed() && second.is_closed());
    assert_eq!(authority.count(Call::Direct), 2);
}

#[tokio::test]
async fn test_children_unmount_concurrently() {
    let delay = Duration::from_millis(300);
    let (controller, authority) = controller(Script {
        unmount_delay: Some(delay),
        ..Script::default()
    });
    let node = Scope::root("node");
    let mut mounts = Vec::new();
    for mountpoint in ["/mnt/a", "/mnt/b", "/mnt/c"] {
        mounts.push(assert_ok!(controller.mount(&node, blocks(), mountpoint, "").await));
    }

    let started = Instant::now();
    assert_ok!(node.close().await);
    let elapsed = started.elapsed();

    assert_eq!(authority.count(Call::Direct), 3);
    assert!(mounts.iter().all(|mount| mount.is_closed()));
    assert!(elapsed >= delay);
    assert!(elapsed < delay * 2, "children closed one after another: {:?}", elapsed);
}

#[tokio::test]
async fn test_external_release_ends_serving() {
    let (controller, authority) = controller(Script::default());
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    assert!(mount.is_serving());
    assert_err!(tokio::time::timeout(Duration::from_millis(50), mount.serve_exited()).await);

    authority.release_externally(Path::new("/mnt/x"));
    assert_ok!(tokio::time::timeout(Duration::from_secs(5), mount.serve_exited()).await);

    assert!(!mount.is_serving());
    assert!(!mount.is_closed());
    assert_ok!(mount.unmount().await);
    assert_eq!(authority.count(Call::Direct), 1);
}

#[tokio::test]
async fn test_mount_under_closed_scope_is_released() {
    let (controller, authority) = controller(Script::default());
    let node = Scope::root("node");
    assert_ok!(node.close().await);

    let err = assert_err!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    assert!(matches!(err, MountError::Closed(_)));
    assert_eq!(authority.calls(), vec![Call::Mount, Call::Direct]);
}

#[tokio::test]
async fn test_close_handle_follows_direct_failure() {
    let (controller, authority) = controller(Script {
        direct_ok: false,
        ..Script::default()
    });
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    assert_ok!(mount.unmount().await);

    assert_eq!(authority.calls(), vec![Call::Mount, Call::Direct, Call::Close]);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_order() {
    let authority = MockAuthority::new(Script {
        direct_ok: false,
        close_ok: false,
        force_succeeds_on: Some(1),
        ..Script::default()
    });
    let observer = Arc::new(RecordingObserver::default());
    let controller = MountController::with_observer(authority.clone(), observer.clone());
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "").await);

    assert_ok!(mount.unmount().await);

    assert_eq!(
        authority.calls(),
        vec![Call::Mount, Call::Direct, Call::Close, Call::Force]
    );
    assert_eq!(
        observer.events(),
        vec![
            "mounting",
            "mounted",
            "unmounting",
            "failed: direct unmount",
            "failed: connection close",
            "force #1",
            "unmounted: forced unmount",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_force_succeeds_on_last_attempt() {
    let (controller, authority) = controller(Script {
        direct_ok: false,
        close_ok: false,
        force_succeeds_on: Some(FORCE_UNMOUNT_ATTEMPTS),
        ..Script::default()
    });
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/x", "").await);
    let started = tokio::time::Instant::now();

    assert_ok!(mount.unmount().await);

    assert_eq!(authority.count(Call::Force), FORCE_UNMOUNT_ATTEMPTS);
    let pauses = FORCE_UNMOUNT_ATTEMPTS as u32 - 1;
    assert!(started.elapsed() >= FORCE_UNMOUNT_DELAY * pauses);
}

#[tokio::test(start_paused = true)]
async fn test_force_exhaustion_fails() {
    let authority = MockAuthority::new(Script {
        direct_ok: false,
        close_ok: false,
        force_succeeds_on: None,
        ..Script::default()
    });
    let observer = Arc::new(RecordingObserver::default());
    let controller = MountController::with_observer(authority.clone(), observer.clone());
    let node = Scope::root("node");
    let mount = assert_ok!(controller.mount(&node, blocks(), "/mnt/stuck", "").await);

    let err = assert_err!(node.close().await);

    match err {
        MountError::UnmountFailed { path, attempts, source } => {
            assert_eq!(path, Path::new("/mnt/stuck"));
            assert_eq!(attempts, FORCE_UNMOUNT_ATTEMPTS);
            assert_eq!(source.raw_os_error(), Some(libc::EBUSY));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(mount.is_closed());
    assert_eq!(authority.count(Call::Force), FORCE_UNMOUNT_ATTEMPTS);
    assert_eq!(
        observer.events().last().map(String::as_str),
        Some("gave up after 10")
    );
}
