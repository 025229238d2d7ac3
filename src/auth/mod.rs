pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtHandler};
pub use middleware::{auth_middleware, client_meta, require_operator, ClientMeta};
