use {anyhow::Result, clap::Subcommand};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration.
    Show {
        /// Output as JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
    /// Print the config file path and the data directory.
    Path,
    /// Write the effective configuration to the config file.
    Init,
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    let config = parley_config::discover_and_load();
    match action {
        ConfigAction::Show { json } => {
            let rendered = if json {
                serde_json::to_string_pretty(&config)?
            } else {
                toml::to_string_pretty(&config)?
            };
            println!("{rendered}");
        },
        ConfigAction::Path => {
            println!(
                "config: {}",
                parley_config::find_or_default_config_path().display()
            );
            println!("data:   {}", parley_config::data_dir(&config).display());
        },
        ConfigAction::Init => {
            let path = parley_config::save_config(&config)?;
            eprintln!("Wrote {}", path.display());
        },
    }
    Ok(())
}
