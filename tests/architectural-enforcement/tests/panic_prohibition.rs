//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates failures as `Result`/`Option`
//! values. `unwrap()` and `expect()` are reserved for tests.

use architectural_enforcement::{report, scan, PRODUCTION_DIRS};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(PRODUCTION_DIRS, |_, code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });
    report("unwrap()/expect() found in production code", &violations);
}
