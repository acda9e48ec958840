/// Session key holding the authenticated username.
pub const USER_ID: &str = "user_id";
