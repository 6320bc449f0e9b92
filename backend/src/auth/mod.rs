pub mod jwt;
pub mod middleware;
pub mod rbac;

pub use jwt::{Claims, JwtKeys};
pub use middleware::AuthUser;
pub use rbac::{RoleTablePermissions, Table, TableAction, TablePermissions};
