//! Integration tests for idle reclamation by the background reaper.
//!
//! These tests run a real reaper thread, so they are ignored under Miri.

use std::time::Duration;

use memctx::{ContextManager, Error, PoolConfig};
use testing::{CallbackCounter, wait_until, with_watchdog};

const GENEROUS: Duration = Duration::from_secs(5);

fn fast_reaping_manager(max_references: u32, max_idle_time: Duration) -> ContextManager {
    ContextManager::builder()
        .max_references(max_references)
        .max_idle_time(max_idle_time)
        .cleanup_interval(Duration::from_millis(10))
        .build()
        .unwrap()
}

#[cfg_attr(miri, ignore)]
#[test]
fn ceiling_then_reap_walkthrough() {
    with_watchdog(|| {
        let manager = fast_reaping_manager(2, Duration::from_millis(100));

        let (context, was_existing) = manager.get_or_create("A").unwrap();
        assert!(!was_existing);
        assert_eq!(context.reference_count(), 1);

        let (_, was_existing) = manager.get_or_create("A").unwrap();
        assert!(was_existing);
        assert_eq!(context.reference_count(), 2);

        assert!(matches!(
            manager.get_or_create("A"),
            Err(Error::MaxReferencesReached { .. })
        ));

        manager.return_context(&context).unwrap();
        manager.return_context(&context).unwrap();
        assert_eq!(context.reference_count(), 0);

        assert!(wait_until(GENEROUS, || context.is_closed()));
        assert!(!manager.contains("A"));

        assert!(matches!(
            manager.close("A"),
            Err(Error::ContextNotFound { .. })
        ));

        manager.shutdown().unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn referenced_context_is_never_reaped() {
    with_watchdog(|| {
        let manager = fast_reaping_manager(10, Duration::from_millis(10));

        let (held, _) = manager.get_or_create("held").unwrap();
        let (idle, _) = manager.get_or_create("idle").unwrap();
        manager.return_context(&idle).unwrap();

        assert!(wait_until(GENEROUS, || idle.is_closed()));

        // Several more reaper ticks pass while the held context stays idle but referenced.
        std::thread::sleep(Duration::from_millis(100));

        assert!(!held.is_closed());
        assert!(manager.validate(&held));
        assert!(manager.contains("held"));

        manager.return_context(&held).unwrap();
        manager.shutdown().unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn reaping_cascades_to_children_and_pools() {
    with_watchdog(|| {
        let manager = fast_reaping_manager(10, Duration::from_millis(20));
        let counter = CallbackCounter::new();

        let (root, _) = manager.get_or_create("batch-job").unwrap();
        let child = root.create_child().unwrap();
        let grandchild = child.create_child().unwrap();

        for context in [&root, &child, &grandchild] {
            context
                .create_pool(
                    PoolConfig::new().prewarm(2),
                    counter.allocator(|| vec![0_u8; 32]),
                    counter.cleaner::<Vec<u8>>(),
                )
                .unwrap();
        }

        let leaf_pool = grandchild.get_pool::<Vec<u8>>().unwrap();
        assert_eq!(counter.allocated(), 6);

        manager.return_context(&root).unwrap();

        assert!(wait_until(GENEROUS, || root.is_closed()));
        assert!(child.is_closed());
        assert!(grandchild.is_closed());
        assert!(leaf_pool.is_closed());
        assert_eq!(counter.live(), 0);

        manager.shutdown().unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn pool_activity_does_not_keep_context_alive() {
    with_watchdog(|| {
        let manager = fast_reaping_manager(10, Duration::from_millis(50));
        let counter = CallbackCounter::new();

        let (context, _) = manager.get_or_create("http-request").unwrap();
        context
            .create_pool(
                PoolConfig::new(),
                counter.allocator(String::new),
                counter.cleaner::<String>(),
            )
            .unwrap();
        manager.return_context(&context).unwrap();

        // Keep using the pools without going through the manager.
        let closed = wait_until(GENEROUS, || {
            if let Some(text) = context.acquire::<String>() {
                context.release(text);
            }

            context.is_closed()
        });

        assert!(closed);
        manager.shutdown().unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn sharing_refreshes_idle_time() {
    with_watchdog(|| {
        let manager = fast_reaping_manager(10, Duration::from_millis(200));

        let (context, _) = manager.get_or_create("batch-job").unwrap();
        manager.return_context(&context).unwrap();

        // Each share/return pair restarts the idle clock, so the context survives well past
        // its idle threshold as long as it keeps being used.
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(50));
            let (shared, was_existing) = manager.get_or_create("batch-job").unwrap();
            assert!(was_existing);
            manager.return_context(&shared).unwrap();
        }

        assert!(!context.is_closed());

        assert!(wait_until(GENEROUS, || context.is_closed()));
        manager.shutdown().unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn no_reaping_after_shutdown() {
    with_watchdog(|| {
        let manager = fast_reaping_manager(10, Duration::from_millis(10));

        let (context, _) = manager.get_or_create("batch-job").unwrap();
        manager.shutdown().unwrap_err();

        // Shutdown failed because of the held reference but the reaper is already stopped,
        // so returning the reference does not lead to the context being reaped.
        manager.return_context(&context).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(!context.is_closed());
        assert!(manager.contains("batch-job"));

        manager.shutdown().unwrap();
        assert!(context.is_closed());
        assert!(matches!(manager.shutdown(), Err(Error::ContextManagerClosed)));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn disabled_reaper_leaves_idle_contexts_alone() {
    with_watchdog(|| {
        let manager = ContextManager::builder()
            .max_idle_time(Duration::from_millis(1))
            .cleanup_interval(Duration::ZERO)
            .build()
            .unwrap();

        let (context, _) = manager.get_or_create("batch-job").unwrap();
        manager.return_context(&context).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(!context.is_closed());

        // Manual reaping still works.
        assert_eq!(manager.reap_idle().unwrap(), 1);
        assert!(context.is_closed());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn dropping_manager_stops_reaper() {
    with_watchdog(|| {
        let manager = fast_reaping_manager(10, Duration::from_millis(10));
        let (context, _) = manager.get_or_create("batch-job").unwrap();
        manager.return_context(&context).unwrap();

        drop(manager);
        std::thread::sleep(Duration::from_millis(100));

        // Reaping requires the manager; with the manager gone the context is only released
        // when its last handle is dropped.
        assert!(!context.is_closed());
    });
}
