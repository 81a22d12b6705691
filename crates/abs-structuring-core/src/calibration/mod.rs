pub mod nominal;
