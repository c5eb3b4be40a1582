use crate::config::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// App home directory (`~/.mcpweave`), created on demand.
pub fn weave_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let dir = home.join(".mcpweave");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(weave_home()?.join("config.json"))
}

/// Load configuration, merging an optional user overlay on top of the base
/// file (overlay keys win, recursively). Environment variables fill in any
/// credentials the files leave empty.
pub fn load_config(base_path: Option<&Path>, overlay_path: Option<&Path>) -> Result<Config> {
    let default_path = default_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = base_path.unwrap_or(default_path.as_path());

    let mut data = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str::<Value>(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?
    } else {
        Value::Object(serde_json::Map::new())
    };

    if let Some(overlay) = overlay_path {
        let content = fs::read_to_string(overlay)
            .with_context(|| format!("Failed to read overlay config from {}", overlay.display()))?;
        let overlay_data: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse overlay JSON from {}", overlay.display()))?;
        data = merge_values(data, overlay_data);
    }

    let mut config: Config =
        serde_json::from_value(data).context("Failed to deserialize config")?;
    apply_env(&mut config);
    Ok(config)
}

/// Recursive merge: overlay object keys win; non-objects replace wholesale.
fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Fill credentials and endpoints from the environment where the config
/// files left them unset.
fn apply_env(config: &mut Config) {
    fn fill(slot: &mut Option<String>, var: &str) {
        if slot.is_none()
            && let Ok(value) = std::env::var(var)
            && !value.is_empty()
        {
            *slot = Some(value);
        }
    }

    fill(&mut config.providers.anthropic_api_key, "ANTHROPIC_API_KEY");
    fill(&mut config.providers.openai_api_key, "OPENAI_API_KEY");
    fill(&mut config.providers.openrouter_api_key, "OPENROUTER_API_KEY");

    fill(&mut config.tracing.langfuse_public_key, "LANGFUSE_PUBLIC_KEY");
    fill(&mut config.tracing.langfuse_secret_key, "LANGFUSE_SECRET_KEY");
    fill(&mut config.tracing.langfuse_base_url, "LANGFUSE_BASE_URL");
    fill(&mut config.tracing.langsmith_api_key, "LANGSMITH_API_KEY");
    fill(&mut config.tracing.langsmith_endpoint, "LANGSMITH_ENDPOINT");
    fill(&mut config.tracing.langsmith_project, "LANGSMITH_PROJECT");

    fill(&mut config.broker.api_token, "MCP_API_TOKEN");

    // MCP_API_URL names the code-exec broker endpoint; derive the bind
    // address from it when present.
    if let Ok(url) = std::env::var("MCP_API_URL")
        && let Some((host, port)) = parse_host_port(&url)
    {
        config.broker.host = host;
        config.broker.port = port;
    }
}

fn parse_host_port(url: &str) -> Option<(String, u16)> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let authority = rest.split('/').next()?;
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), 80)),
    }
}

pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let default_path = default_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    // Config may hold API keys; keep it private (best-effort on non-unix).
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }

    Ok(())
}
