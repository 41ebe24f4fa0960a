//! Candidate admission during search

/// Decides whether a local node id may appear in results
///
/// Non-members may still be traversed as graph waypoints.
pub trait IdSelector: Sync {
    /// True if `id` may be returned
    fn is_member(&self, id: u32) -> bool;
}

impl<F> IdSelector for F
where
    F: Fn(u32) -> bool + Sync,
{
    fn is_member(&self, id: u32) -> bool {
        self(id)
    }
}
