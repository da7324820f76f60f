//! CLI subcommand: `credproxy sweep`

use anyhow::Result;

use crate::config::Config;

pub fn run(config: &Config) -> Result<()> {
    let base = config.base_dir();
    let report = super::run_sweep(config);

    for path in &report.removed {
        println!("removed  {}", path.display());
    }
    for path in &report.failed {
        println!("failed   {}", path.display());
    }
    println!(
        "{}: {} removed, {} still owned, {} failed",
        base.display(),
        report.removed.len(),
        report.retained,
        report.failed.len()
    );

    if !report.failed.is_empty() {
        anyhow::bail!("{} orphaned resource(s) could not be removed", report.failed.len());
    }
    Ok(())
}
