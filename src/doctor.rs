use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::capability::CREDENTIAL_KEYS;
use crate::catalog::Catalog;
use crate::config::{RuntimeConfig, display_api_base};
use crate::memory::RecallStore;
use crate::provider::{detect_provider, env_present, provider_label};

pub fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("DEEPSEEK_API_KEY", env_present("DEEPSEEK_API_KEY")),
        ("GROQ_API_KEY", env_present("GROQ_API_KEY")),
        ("OLLAMA_HOST", env_present("OLLAMA_HOST")),
    ];

    println!("Provider environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    match detect_provider() {
        Some(provider) => println!("Auto provider resolution: {}", provider_label(provider)),
        None => {
            println!("Auto provider resolution: none");
            println!("Tip: export one provider key or run with --provider ollama");
        }
    }
    println!(
        "Configured provider: {} model_override={} api_base={}",
        provider_label(cfg.provider),
        cfg.model.as_deref().unwrap_or("<provider-default>"),
        display_api_base(cfg)
    );

    println!("Capability credentials:");
    for key in CREDENTIAL_KEYS {
        let status = if env_present(key) {
            "set"
        } else {
            "missing (capabilities needing it will be dropped)"
        };
        println!("- {key}: {status}");
    }

    let (catalog, catalog_status) = check_catalog(cfg);
    println!("{catalog_status}");

    let role_map = cfg.role_capability_map();
    let policy = cfg.capability_policy();
    let referenced =
        role_map.referenced_names(catalog.iter().flat_map(|definition| definition.roles.iter()));
    let blocked = referenced
        .iter()
        .filter(|name| !policy.permits(name))
        .cloned()
        .collect::<Vec<String>>();
    println!(
        "Capabilities referenced by roles: {}",
        if referenced.is_empty() {
            "<none>".to_string()
        } else {
            referenced.iter().cloned().collect::<Vec<String>>().join(", ")
        }
    );
    if !blocked.is_empty() {
        println!("Blocked by capability policy: {}", blocked.join(", "));
    }

    let workspace = PathBuf::from(&cfg.workspace_root);
    println!(
        "Workspace root: {} ({})",
        workspace.display(),
        if workspace.is_dir() { "ok" } else { "missing" }
    );

    if cfg.memory_enabled {
        let store = RecallStore::open(Path::new(&cfg.memory_store_path))?;
        println!(
            "Recall store: {}/{} entries ({})",
            store.len(),
            cfg.memory_max_entries,
            cfg.memory_store_path
        );
    } else {
        println!("Recall store: disabled (enable with `run --memory` or `memory = true`)");
    }

    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    Ok(())
}

/// A broken catalog file is reported, and the remaining checks fall back to
/// the built-in workflows.
fn check_catalog(cfg: &RuntimeConfig) -> (Catalog, String) {
    let source = cfg.catalog_path.as_deref().unwrap_or("built-in only");
    match Catalog::load(cfg.catalog_path.as_deref().map(Path::new)) {
        Ok(catalog) => {
            let status = format!("Catalog: {} workflow(s) loaded ({source})", catalog.len());
            (catalog, status)
        }
        Err(err) => (
            Catalog::builtin(),
            format!("Catalog: invalid ({source}): {err:#}"),
        ),
    }
}
