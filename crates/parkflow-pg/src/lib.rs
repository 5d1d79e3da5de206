mod connect;
mod error;
mod sink;

pub use connect::connect_postgres;
pub use error::{PgError, PgResult};
pub use sink::{quote_table, PostgresSink, DEFAULT_TABLE};
