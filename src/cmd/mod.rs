//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `migrate` | `Migrate`        |
//! | `schema`  | `Schema`         |

pub mod migrate;
pub mod schema;
pub mod serve;

pub use migrate::cmd_migrate;
pub use schema::cmd_schema;
pub use serve::cmd_serve;
