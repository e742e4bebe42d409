use anyhow::Context;
use serde::Serialize;
use strand_config::ConfigLoad;
use strand_core::OrchestratorConfig;

#[derive(Serialize)]
struct ShowJson<'a> {
    source: String,
    env_file_loaded: bool,
    overrides: &'a [&'static str],
    config: &'a OrchestratorConfig,
}

pub fn render(load: &ConfigLoad, json: bool) -> anyhow::Result<String> {
    if json {
        let payload = ShowJson {
            source: load.source.to_string(),
            env_file_loaded: load.env_file_loaded,
            overrides: &load.overrides,
            config: &load.config,
        };
        return serde_json::to_string_pretty(&payload)
            .context("failed to encode configuration");
    }

    let body = toml::to_string_pretty(&load.config)
        .context("failed to encode configuration")?;
    let mut header = format!("# source: {}\n", load.source);
    if !load.overrides.is_empty() {
        let overrides = load.overrides.join(", ");
        header.push_str(&format!("# overrides: {overrides}\n"));
    }
    Ok(format!("{header}{body}"))
}
