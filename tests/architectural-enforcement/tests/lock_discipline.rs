//! Integration Test: Lock Discipline
//!
//! **Policy**: Shared state in the core uses `parking_lot` or `dashmap`
//! locks, which cannot be poisoned and are never held across an `.await`.
//! `std::sync::Mutex`/`RwLock` and `tokio::sync::Mutex` are not used.

use architectural_enforcement::{report, scan};

#[test]
fn test_core_uses_parking_lot_locks() {
    let violations = scan(&["switchboard/core/src"], |_, code| {
        code.contains("std::sync::Mutex")
            || code.contains("std::sync::RwLock")
            || code.contains("tokio::sync::Mutex")
            || code.contains("tokio::sync::RwLock")
    });
    report("Non-parking_lot lock found in the core", &violations);
}
