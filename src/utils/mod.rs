pub mod atomic_write;
pub mod data_dir;
pub mod log_file;
pub mod sos;
