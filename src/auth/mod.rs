mod middleware;

pub use middleware::{AuthError, RequireOwner, USER_ID_HEADER};
