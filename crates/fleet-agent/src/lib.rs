pub mod inventory;
pub mod lifecycle;
pub mod procs;
pub mod session;
