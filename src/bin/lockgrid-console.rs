//! Interactive lock console for a single grid member.
//!
//! Usage: `lockgrid-console [member-id]`

use lockgrid::{Console, LockService, Locks, LocksConfig};
use std::env;
use std::io;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they do not interleave with command output
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "lockgrid=info".to_string()))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let member_id: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);

    let service = Arc::new(LockService::new());
    let locks = Locks::new(LocksConfig::new(member_id), service)?;
    let console = Console::new(Arc::new(locks));

    println!("Lock console for member {}. Commands: LOCK, UNLOCK, DUMP, SERVER, EXIT", member_id);
    console.run(io::stdin().lock(), io::stdout())?;
    Ok(())
}
