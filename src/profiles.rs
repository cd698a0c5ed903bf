use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_api_base};
use crate::provider::provider_label;

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(", ")
    }
}

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {}", provider_label(cfg.provider));
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!("API base: {}", display_api_base(cfg));
    println!(
        "Catalog path: {}",
        cfg.catalog_path.as_deref().unwrap_or("<built-in only>")
    );
    println!("Workspace root: {}", cfg.workspace_root);
    println!("Goal template: {}", cfg.goal_template);
    println!("Task timeout (secs): {}", cfg.task_timeout_secs);
    println!("Max tool rounds: {}", cfg.max_tool_rounds);
    println!("Max retries: {}", cfg.max_retries);
    println!(
        "Memory: enabled={} strategy={:?} window={} store={} max_entries={}",
        cfg.memory_enabled,
        cfg.memory_strategy,
        cfg.memory_window,
        cfg.memory_store_path,
        cfg.memory_max_entries
    );
    println!(
        "Mandatory capabilities: {}",
        join_or_none(&cfg.mandatory_capabilities)
    );
    println!(
        "Capability allow list: {}",
        join_or_none(&cfg.allow_capabilities)
    );
    println!(
        "Capability deny list: {}",
        join_or_none(&cfg.deny_capabilities)
    );
    if cfg.role_capabilities.is_empty() {
        println!("Role capability overrides: <none>");
    } else {
        let mut roles = cfg.role_capabilities.iter().collect::<Vec<_>>();
        roles.sort();
        println!("Role capability overrides:");
        for (role, capabilities) in roles {
            println!("- {role}: {}", join_or_none(capabilities));
        }
    }
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
