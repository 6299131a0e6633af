//! Config command handlers.

use anyhow::{Context, Result};
use tern_core::config::{Config, paths};

pub fn path() -> Result<()> {
    println!("{}", paths::config_file().display());
    Ok(())
}

pub fn init() -> Result<()> {
    let path = paths::config_file();
    let created = Config::init_at(&path).context("initialize config")?;
    if created {
        println!("Created {}", path.display());
    } else {
        println!("Config already exists at {}", path.display());
    }
    Ok(())
}
