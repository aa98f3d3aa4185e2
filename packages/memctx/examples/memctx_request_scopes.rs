//! Example showing per-request contexts shared between worker threads.
//!
//! Each worker leases the context for the request kind it handles, takes buffers from the
//! context's pool and gives them back. Once the workers are done, the idle context is closed by
//! the background reaper.

use std::thread;
use std::time::Duration;

use memctx::{ContextManager, PoolConfig};

fn main() {
    let manager = ContextManager::builder()
        .max_references(4)
        .max_idle_time(Duration::from_millis(200))
        .cleanup_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    {
        let setup = manager.acquire("http-request").unwrap();
        setup
            .create_pool(PoolConfig::new(), || Vec::<u8>::with_capacity(4096), drop)
            .unwrap();
    }

    thread::scope(|s| {
        for worker in 0..4 {
            let manager = &manager;

            s.spawn(move || {
                let lease = manager.acquire("http-request").unwrap();
                assert!(lease.was_existing());

                let mut body = lease.acquire::<Vec<u8>>().unwrap();
                body.clear();
                body.extend_from_slice(format!("response from worker {worker}").as_bytes());
                println!("{}", String::from_utf8_lossy(&body));
                lease.context().release(body);
            });
        }
    });

    println!(
        "Context types after the workers finished: {:?}",
        manager.context_types()
    );

    thread::sleep(Duration::from_millis(500));

    println!(
        "Context types after idle reclamation: {:?}",
        manager.context_types()
    );

    manager.shutdown().unwrap();
}
