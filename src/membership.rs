use crate::error::MembershipError;
use crate::signaling::UserInfo;
use async_trait::async_trait;

/// Records room membership outside signaling (a join/leave REST pair).
/// Both calls are idempotent; the session makes each once.
#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn join(&self, room_code: &str, user: &UserInfo) -> Result<(), MembershipError>;

    async fn leave(&self, room_code: &str, user: &UserInfo) -> Result<(), MembershipError>;
}

/// Membership is not recorded anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMembership;

#[async_trait]
impl MembershipService for NoMembership {
    async fn join(&self, _room_code: &str, _user: &UserInfo) -> Result<(), MembershipError> {
        Ok(())
    }

    async fn leave(&self, _room_code: &str, _user: &UserInfo) -> Result<(), MembershipError> {
        Ok(())
    }
}
