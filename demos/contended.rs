//! Three members contending for one lock, then one of them fails.
//!
//! Run with: `cargo run --example contended`

use lockgrid::{ClusterMembership, Lock, LockRecovery, LockService, Locks, LocksConfig};
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "lockgrid=debug,info".to_string()))
        .init();

    let service = Arc::new(LockService::new());
    let (membership, events) = ClusterMembership::new(1);

    // Recovery follows the membership channel
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let recovery = LockRecovery::new(service.clone());
    let recovery_task = tokio::spawn(recovery.run_event_loop(events, shutdown_rx));

    let mut members = Vec::new();
    for member_id in 1..=3 {
        membership.handle_member_joined(member_id);
        let config = LocksConfig::new(member_id).with_poll_interval(Duration::from_millis(50));
        members.push(Arc::new(Locks::new(config, service.clone())?));
    }

    // Member 3 takes the lock and never releases it
    let stuck = members[2].exclusive_lock("jobs");
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        if stuck.lock().is_ok() {
            let _ = held_tx.send(());
            thread::park();
        }
    });
    held_rx.recv()?;

    let mut workers = Vec::new();
    for locks in members.iter().take(2) {
        for worker in 0..2 {
            let lock = locks.exclusive_lock("jobs");
            let member_id = locks.member_id();
            workers.push(thread::spawn(move || -> lockgrid::Result<()> {
                let _guard = lock.guard()?;
                println!("member {} worker {} holds {}", member_id, worker, lock);
                thread::sleep(Duration::from_millis(20));
                Ok(())
            }));
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("--- before failure ---");
    for line in service.dump() {
        println!("{}", line);
    }

    membership.handle_member_failed(3);

    for worker in workers {
        if let Ok(Err(e)) = worker.join() {
            eprintln!("worker failed: {}", e);
        }
    }

    println!("--- after failure ---");
    println!("holders left: {}", service.dump().len());
    for locks in &members[..2] {
        println!("member {}: {}", locks.member_id(), locks.metrics().snapshot());
    }

    shutdown_tx.send(()).await?;
    recovery_task.await?;
    Ok(())
}
