pub mod rdp;
pub mod types;
