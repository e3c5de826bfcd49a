//! Filters incoming operations against the client's latest full-state op
//! (`SYNC_IMPORT` / `BACKUP_IMPORT` / `REPAIR`), so that history predating an
//! intentional reset cannot resurrect an entity.
//!
//! Pure and side-effect free: the caller is responsible for locating the
//! latest full-state op (see `getLatestFullStateOp` on the operation log
//! store) and for comparing against the *unpruned* clocks.

use crate::operation::Operation;
use crate::vector_clock::ClockOrdering;

/// Returns true if `op` survives filtering against `full_state_op`.
///
/// An op is kept iff at least one holds:
/// 1. There is no local full-state op.
/// 2. `op.id` sorts lexicographically after `full_state_op.id` (authored
///    after the import).
/// 3. `op.client_id == full_state_op.client_id` and `op`'s counter for that
///    client strictly exceeds the full-state op's counter for it (true even
///    if pruning has since dropped other evidence).
/// 4. `compare(op.vector_clock, full_state_op.vector_clock)` is `Greater`.
pub fn keep(op: &Operation, full_state_op: Option<&Operation>) -> bool {
    let full_state_op = match full_state_op {
        None => return true,
        Some(full_state_op) => full_state_op,
    };

    if op.id > full_state_op.id {
        return true;
    }

    if op.client_id == full_state_op.client_id {
        let op_counter = op.vector_clock.get(&op.client_id);
        let full_state_counter = full_state_op.vector_clock.get(&full_state_op.client_id);
        if op_counter > full_state_counter {
            return true;
        }
    }

    matches!(
        op.vector_clock.compare(&full_state_op.vector_clock),
        ClockOrdering::Greater
    )
}

/// Filters a batch, keeping only the ops that survive [`keep`].
pub fn filter_batch<'a>(
    ops: &'a [Operation],
    full_state_op: Option<&Operation>,
) -> Vec<&'a Operation> {
    ops.iter().filter(|op| keep(op, full_state_op)).collect()
}
