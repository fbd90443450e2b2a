pub mod init;
pub mod keys;
pub mod start;
