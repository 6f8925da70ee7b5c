//! Host configuration loading.
//!
//! Config files: `parley.toml`, `parley.yaml`, `parley.yml` or `parley.json`.
//! Searched in `./` then `~/.config/parley/`, unless `--config-dir` points
//! elsewhere.

pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, clear_data_dir, config_dir, data_dir, discover_and_load,
        find_or_default_config_path, load_config, save_config, set_config_dir, set_data_dir,
    },
    schema::{ExtensionsConfig, HooksConfig, ModelConfig, ParleyConfig},
};
