use civicbrief_core::UserId;

/// Caller identity for a request.
///
/// Asserted by the upstream gateway; present for all `/briefs` and
/// `/notifications` routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
}

impl UserContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
