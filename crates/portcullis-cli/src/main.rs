//! Portcullis plugins CLI - installs and checks the plugins declared in the
//! static configuration

mod cli;

use anyhow::{Context, anyhow};
use clap::Parser;
use cli::{Cli, Commands};
use http::StatusCode;
use portcullis_kernel::{handler_fn, text_response};
use portcullis_plugins::{
    Builder, Manager, PluginType, StaticConfig, setup_local_plugins, setup_remote_plugins,
};
use serde_json::Map;
use std::sync::Arc;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command_async(cli))
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    let cfg = StaticConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let downloader = cfg.downloader(cfg.storage.output.join("archives"))?;
    let manager = Manager::new(Arc::new(downloader), &cfg.storage.output)?;

    match cli.command {
        Commands::Install { no_check } => {
            setup_remote_plugins(&manager, &cfg.plugins)
                .await
                .map_err(|report| anyhow!("{report:?}"))?;
            setup_local_plugins(&cfg.storage.local_root, &cfg.local_plugins)
                .map_err(|report| anyhow!("{report:?}"))?;

            if !no_check {
                check_plugins(&cfg, &manager)?;
            }
        }

        Commands::State => match manager.read_state()? {
            Some(state) => {
                for (module, version) in state {
                    println!("{module} {version}");
                }
            }
            None => println!("no plugins installed"),
        },

        Commands::Reset => {
            manager.reset_all()?;
            info!(output = %cfg.storage.output.display(), "plugin storage removed");
        }
    }

    Ok(())
}

/// Loads every plugin and builds it once with its manifest test data.
fn check_plugins(cfg: &StaticConfig, manager: &Manager) -> anyhow::Result<()> {
    let builder = Builder::with_limits(
        manager.sources_root(),
        &cfg.plugins,
        &cfg.storage.local_root,
        &cfg.local_plugins,
        &cfg.limits,
    )?;

    let mut aliases: Vec<&str> = builder.aliases().collect();
    aliases.sort_unstable();

    for alias in aliases {
        let Some(manifest) = builder.manifest(alias) else {
            continue;
        };
        let test_data = manifest.test_data.as_object().cloned().unwrap_or_else(Map::new);

        match manifest.plugin_type {
            PluginType::Middleware => {
                let middleware = builder
                    .build(alias, &test_data, &format!("{alias}-check"))
                    .with_context(|| format!("plugin {alias}"))?;
                let next = handler_fn(|_req| async { text_response(StatusCode::OK, "") });
                middleware
                    .new_handler(next)
                    .with_context(|| format!("plugin {alias}: handler construction"))?;
                if builder.is_tcp_capable(alias) {
                    builder
                        .build_tcp(alias, &test_data, &format!("{alias}-check"))
                        .with_context(|| format!("plugin {alias}: TCP middleware"))?;
                }
            }
            PluginType::Provider => {
                let provider = builder
                    .build_provider(alias, &test_data)
                    .with_context(|| format!("plugin {alias}"))?;
                provider
                    .init()
                    .with_context(|| format!("plugin {alias}: provider init"))?;
            }
        }

        println!("{alias} ({}, {}) ok", manifest.display_name, manifest.runtime);
    }

    Ok(())
}
