pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod receiver;
pub mod spec;
pub mod processing {
    pub mod blur;
    pub mod decode;
    pub mod layout;
}
pub mod tasks {
    pub mod actor;
    pub mod coordinator;
    pub mod transport;
    pub mod watchers;
    pub mod workers;
}
