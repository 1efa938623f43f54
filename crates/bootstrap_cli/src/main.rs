//! CLI inspector for loader configuration resolution.
//!
//! # Responsibility
//! - Resolve the loader snapshot for a host executable from the command line
//!   the same way the injected module does, without touching any process.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `bootstrap_cli <host executable> [--melonloader.* options]`

use bootstrap_core::config::{HostPaths, LaunchOptions, LoaderConfig};
use bootstrap_core::runtime::mono::environment::{compose_assemblies_path, debugger_argument};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(host) = args.next().and_then(HostPaths::from_executable) else {
        eprintln!("usage: bootstrap_cli <host executable> [options]");
        return ExitCode::from(2);
    };
    let options = LaunchOptions::parse(args);
    let config = LoaderConfig::resolve(&options, &host);

    println!("bootstrap_core version={}", bootstrap_core::core_version());
    println!(
        "host data_dir={}",
        host.data_directory()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("config={json}"),
        Err(err) => eprintln!("config serialization failed: {err}"),
    }
    if config.loader.debug_mode {
        println!("debugger_argument={}", debugger_argument(&config.debug_server, false));
        println!(
            "debugger_argument_legacy={}",
            debugger_argument(&config.debug_server, true)
        );
    }
    println!(
        "assemblies_path={}",
        compose_assemblies_path(
            config.unity_engine.mono_search_path_override.as_deref(),
            config.base_dir(),
            false,
            None,
        )
    );
    ExitCode::SUCCESS
}
