use anyhow::Result;

use crate::config::Config;

/// Print the configured entry points and whether each can use the
/// fallback strategy.
pub fn list_entries(config: &Config) -> Result<()> {
    let entries = config.entry_points();
    if entries.is_empty() {
        println!("No entry points configured. Add [[entries]] to the config file.");
        return Ok(());
    }

    println!(
        "{:<24} {:<24} {:<9} LISTING URL",
        "ENTRY",
        format!("{} VALUE", config.index.entry_attribute.to_uppercase()),
        "FALLBACK"
    );
    for entry in &entries {
        let fallback = if entry.listing_url.is_some() && config.fallback.enabled {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<24} {:<24} {:<9} {}",
            entry.name,
            entry.value,
            fallback,
            entry.listing_url.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
