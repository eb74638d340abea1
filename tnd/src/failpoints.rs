use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, TndResult};

/// Between a successful merge and the state write.
pub const HANDLER_AFTER_MERGE_BEFORE_STATE_PERSIST: &str = "handler.after_merge_before_state_persist";
/// Before each incremental batch transaction.
pub const HANDLER_BEFORE_MERGE_BATCH: &str = "handler.before_merge_batch";
/// Between two transactions of a plan that is not applied atomically.
pub const HANDLER_BETWEEN_PLAN_TRANSACTIONS: &str = "handler.between_plan_transactions";

/// Fails with an injected error when the failpoint `name` is configured.
///
/// The failpoint argument picks the kind: `transient` (retried locally) or
/// `fatal` (the default).
pub fn tnd_fail_point(name: &str) -> TndResult<()> {
    fail_point!(name, |parameter| {
        #[cfg(feature = "failpoints")]
        let error_kind = match parameter.as_deref() {
            Some("transient") => ErrorKind::WithTransientFailure,
            _ => ErrorKind::WithFatalFailure,
        };
        #[cfg(not(feature = "failpoints"))]
        let error_kind = {
            let _ = parameter;
            ErrorKind::Unknown
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
