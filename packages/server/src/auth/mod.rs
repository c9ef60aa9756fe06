// Operator authentication: HS256 JWTs plus bcrypt password hashes.

pub mod jwt;

pub use jwt::{Claims, JwtService};
