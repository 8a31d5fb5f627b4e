//! Objects a flow can be bound to

/// Anything identified by a stable, unique string key
///
/// The key is what ledgers are stored under, so it must not change for the
/// lifetime of the object.
///
/// # Example
///
/// ```
/// use flowgate::FlowObject;
///
/// struct ChangeRequest {
///     id: u64,
///     title: String,
/// }
///
/// impl FlowObject for ChangeRequest {
///     fn flow_key(&self) -> String {
///         format!("cr-{}", self.id)
///     }
///
///     fn display_name(&self) -> String {
///         self.title.clone()
///     }
/// }
///
/// let cr = ChangeRequest { id: 7, title: "Bump TLS".into() };
/// assert_eq!(cr.flow_key(), "cr-7");
/// ```
pub trait FlowObject: Send + Sync + 'static {
    /// Stable identity of the object
    fn flow_key(&self) -> String;

    /// Human-readable name, defaults to the key
    fn display_name(&self) -> String {
        self.flow_key()
    }
}

impl FlowObject for String {
    fn flow_key(&self) -> String {
        self.clone()
    }
}
