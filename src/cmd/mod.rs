mod factory;

pub use factory::{cmd_init_db, cmd_serve};
