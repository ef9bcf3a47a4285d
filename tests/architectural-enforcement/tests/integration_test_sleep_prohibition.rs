//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Waiting is done on
//! channels, cancellation tokens, or `tokio::time::interval` ticks.
//! **Exceptions**: test code.

use architectural_enforcement::{report, scan, PRODUCTION_DIRS};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(PRODUCTION_DIRS, |_, code| {
        code.contains("::sleep(") || code.contains(".sleep(")
    });

    if !violations.is_empty() {
        eprintln!("\n✅ ACCEPTABLE waiting:");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Awaiting a channel, a JoinHandle or a CancellationToken");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
    }
    report("Sleep calls found in production code", &violations);
}
