pub mod backup_metadata;
pub mod backup_service;
pub mod local_store;
pub mod object_store;
pub mod process;
pub mod restore_service;
pub mod runner;
pub mod segmenting_reader;
pub mod sink;
pub mod swift_client;
