//! Domain configuration.
//!
//! Maps a sending domain to the settings used to reach its mail server.
//! Settings come from ordered layers; see [`DomainConfig::load`].

mod layers;
mod model;
mod store;

pub use layers::{
    APPLICATION_NAME, CONFIG_FILE_NAME, ConfigPaths, ConfigSource, DomainTable, builtin_domains,
    parse_table, read_layer_file,
};
pub use model::{ConnectionDescriptor, DomainFields, ProtocolId};
pub use store::{DomainConfig, config_file_list, merge_layer};
