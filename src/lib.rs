pub mod channel_store;
pub mod config;
pub mod csv_loader;
pub mod detector;
pub mod device;
pub mod filters;
pub mod frame_parser;
pub mod gesture_buffer;
pub mod gesture_classifier;
pub mod types;
