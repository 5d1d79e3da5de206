mod ingest;
mod init;
mod run;
mod setup;
mod status;

pub use ingest::cmd_ingest;
pub use init::cmd_init;
pub use run::cmd_run;
pub use setup::cmd_setup;
pub use status::cmd_status;
