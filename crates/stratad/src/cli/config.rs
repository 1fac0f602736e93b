use clap::{Parser, ValueEnum};
use eyre::{bail, Result as EyreResult};
use strata_config::hints::{hint_for, CONFIG_HINTS};
use strata_config::{ConfigFile, OutputFormat};

use crate::cli::RootArgs;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PrintFormat {
    Toml,
    Json,
}

impl From<PrintFormat> for OutputFormat {
    fn from(value: PrintFormat) -> Self {
        match value {
            PrintFormat::Toml => Self::Toml,
            PrintFormat::Json => Self::Json,
        }
    }
}

/// Inspect the configuration of a member
#[derive(Debug, Parser)]
pub struct ConfigCommand {
    /// Keys to show, e.g. state_transfer.socket.max_pool
    #[arg(value_name = "KEY")]
    pub keys: Vec<String>,

    /// Format of the full configuration
    #[arg(long, value_enum, default_value_t = PrintFormat::Toml)]
    pub print: PrintFormat,

    /// Describe the keys instead of showing their values
    #[arg(long)]
    pub hints: bool,
}

impl ConfigCommand {
    pub fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        if self.hints {
            return print_hints(&self.keys);
        }

        let path = &root_args.home;

        if !ConfigFile::exists(path) {
            bail!("Member is not initialized in {path:?}");
        }

        let config = ConfigFile::load(path)?;

        if self.keys.is_empty() {
            println!("{}", config.render(self.print.into())?);
            return Ok(());
        }

        for key in &self.keys {
            let Some(value) = config.get_value(key) else {
                bail!("Unknown config key: {key}");
            };
            println!("{key} = {value}");
        }

        Ok(())
    }
}

fn print_hints(keys: &[String]) -> EyreResult<()> {
    if keys.is_empty() {
        println!("Config keys:");
        for hint in CONFIG_HINTS {
            println!("  {}: {}", hint.key, hint.description);
        }
        return Ok(());
    }

    for key in keys {
        let Some(hint) = hint_for(key) else {
            bail!("No hint available for key: {key}");
        };
        println!("{}: {}", hint.key, hint.description);
    }

    Ok(())
}
