//! `spikerun list` and `spikerun versions`.

use spikerun_core::SorterRegistry;

/// Run the list command.
pub fn run_list(registry: &SorterRegistry, installed_only: bool) {
    if installed_only {
        let installed = registry.installed();
        if installed.is_empty() {
            println!("No sorters installed.");
        }
        for name in installed {
            println!("{name}");
        }
        return;
    }

    for name in registry.available() {
        let status = if registry.is_installed(name) {
            "installed"
        } else {
            "not installed"
        };
        println!("{name:<12} {status}");
    }
}

/// Run the versions command: one `name: version` line per installed sorter.
pub fn run_versions(registry: &SorterRegistry) {
    let versions = registry.format_versions();
    if versions.is_empty() {
        println!("No sorters installed.");
    } else {
        println!("{versions}");
    }
}
