/// Ambient login context passed to every coordinator.
///
/// The backend identifies callers by username alone; session mechanics beyond
/// that are owned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
}

impl Session {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}
