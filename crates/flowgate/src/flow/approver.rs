//! Authorization gate

/// A user acting on flow steps
///
/// Consulted synchronously before every approve or reject. A denial leaves
/// the ledger untouched.
pub trait Approver: Send + Sync {
    /// Identity recorded as `resolved_by`
    fn id(&self) -> &str;

    /// Whether this user may resolve `step_id` of `flow_id` for `object_key`
    fn can_handle_flow_step(&self, flow_id: &str, step_id: &str, object_key: &str) -> bool;
}
