//! Authentication primitives: JWT decode and request ingress (§4.7).

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::{ingress_middleware, IngressState};
pub use models::{Claims, Identity};
