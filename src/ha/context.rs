//! Identity of a remote transaction across the wire.

/// Key of the master's transaction table. Equality and hashing cover every
/// field, including the slave's applied-transaction horizon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlaveContext {
    session_id: i64,
    machine_id: i32,
    event_id: i32,
    last_applied: Vec<(String, u64)>,
}

impl SlaveContext {
    pub fn new(
        session_id: i64,
        machine_id: i32,
        event_id: i32,
        last_applied: Vec<(String, u64)>,
    ) -> Self {
        Self {
            session_id,
            machine_id,
            event_id,
            last_applied,
        }
    }

    /// Anonymous context for calls that carry no transaction stream.
    pub fn empty() -> Self {
        Self::new(-1, -1, -1, Vec::new())
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }

    pub fn event_id(&self) -> i32 {
        self.event_id
    }

    pub fn last_applied_transactions(&self) -> &[(String, u64)] {
        &self.last_applied
    }

    pub fn last_applied_for(&self, resource: &str) -> Option<u64> {
        self.last_applied
            .iter()
            .find(|(name, _)| name == resource)
            .map(|(_, tx_id)| *tx_id)
    }

    pub fn with_last_applied(&self, last_applied: Vec<(String, u64)>) -> Self {
        Self::new(self.session_id, self.machine_id, self.event_id, last_applied)
    }
}
