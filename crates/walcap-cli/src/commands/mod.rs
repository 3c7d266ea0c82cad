mod drop;
mod run;
mod status;

pub use drop::cmd_drop;
pub use run::cmd_run;
pub use status::cmd_status;
