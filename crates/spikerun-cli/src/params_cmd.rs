//! `spikerun params` command: show a sorter's parameter table.

use anyhow::Result;

use spikerun_core::SorterRegistry;

/// Run the params command.
pub fn run_params(registry: &SorterRegistry, sorter: &str, json: bool) -> Result<()> {
    let descriptor = registry.descriptor(sorter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptor.gui_params)?);
        return Ok(());
    }

    let status = if descriptor.installed {
        "installed"
    } else {
        "not installed"
    };
    println!("Sorter: {} ({status})", descriptor.name);
    println!();
    println!("  {:<18} {:<6} {:<14} TITLE", "NAME", "TYPE", "DEFAULT");
    for spec in descriptor.default_params.table().specs() {
        println!(
            "  {:<18} {:<6} {:<14} {}",
            spec.name,
            spec.kind.to_string(),
            spec.default.to_string(),
            spec.title
        );
    }

    if !descriptor.installed {
        println!();
        println!("{}", descriptor.installation_instructions);
    }
    Ok(())
}
