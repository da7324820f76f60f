//! CLI subcommand: `credproxy paths`
//!
//! Prints all resolved paths for debugging and scripting.

use anyhow::Result;

use crate::config::Config;

pub fn run(config: &Config) -> Result<()> {
    let paths = &config.paths;

    println!("credproxy Paths");
    println!("===============");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", config.audit_log_path().display());
    println!();
    println!("Runtime:    {}", paths.runtime_dir.display());
    println!("  resources:      {}", config.base_dir().display());

    Ok(())
}
