use bootstrap_core::runtime::mono::environment::{compose_assemblies_path, debugger_argument};
use bootstrap_core::{
    default_log_level, HostPaths, LaunchOptions, LoaderConfig, LogSettings, ModuleHandle,
    MonoSettings,
};
use std::path::Path;

fn host() -> HostPaths {
    HostPaths::from_executable("/games/host/Host.x86_64").unwrap()
}

#[test]
fn debug_options_flow_into_the_debugger_argument() {
    let options = LaunchOptions::parse([
        "/games/host/Host.x86_64",
        "--melonloader.debug",
        "--melonloader.debugipaddress",
        "127.0.0.1",
        "--melonloader.debugport=55000",
    ]);
    let config = LoaderConfig::resolve(&options, &host());

    assert!(config.loader.debug_mode);
    assert_eq!(
        debugger_argument(&config.debug_server, false),
        "--debugger-agent=transport=dt_socket,server=y,address=127.0.0.1:55000,suspend=n"
    );
    assert_eq!(
        debugger_argument(&config.debug_server, true),
        "--debugger-agent=transport=dt_socket,server=y,address=127.0.0.1:55000,suspend=n,defer=y"
    );
}

#[test]
fn suspend_flag_drops_the_no_suspend_suffix() {
    let options = LaunchOptions::parse(["--melonloader.debug", "--melonloader.debugsuspend"]);
    let config = LoaderConfig::resolve(&options, &host());
    assert!(config.debug_server.suspend);
    assert_eq!(
        debugger_argument(&config.debug_server, false),
        "--debugger-agent=transport=dt_socket,server=y,address=127.0.0.1:55555"
    );
}

#[test]
fn scripting_settings_follow_the_resolved_config() {
    let options = LaunchOptions::parse([
        "--melonloader.monosearchpathoverride",
        "Overrides",
        "--no-mods",
        "--melonloader.hideconsole",
    ]);
    let config = LoaderConfig::resolve(&options, &host());
    assert!(config.loader.disable);
    assert!(config.console.hide);

    let settings = MonoSettings::from_config(&config, &host(), ModuleHandle::from_addr(0xB00));
    assert_eq!(settings.debug_agent, None);
    assert_eq!(settings.debugger_override, None);
    assert_eq!(settings.search_path_override.as_deref(), Some("Overrides"));
    assert_eq!(settings.base_dir, Path::new("/games/host"));
}

#[cfg(unix)]
#[test]
fn search_path_lists_overrides_before_the_runtime_root() {
    let path = compose_assemblies_path(
        Some("Overrides:Extra"),
        Path::new("/games/host"),
        false,
        Some("/runtime/lib"),
    );
    assert_eq!(
        path,
        "/games/host/Overrides:/games/host/Extra:/runtime/lib"
    );
}

#[test]
fn log_level_option_overrides_debug_default() {
    let options = LaunchOptions::parse(["--melonloader.debug", "--melonloader.loglevel=trace"]);
    let config = LoaderConfig::resolve(&options, &host());
    assert_eq!(config.log_level(), "trace");
}

#[test]
fn unknown_log_level_falls_back_to_the_default() {
    let options = LaunchOptions::parse(["--melonloader.loglevel=verbose"]);
    let config = LoaderConfig::resolve(&options, &host());
    assert_eq!(config.loader.log_level, None);
    assert_eq!(config.log_level(), default_log_level(false));

    let settings = LogSettings::for_config(&config).expect("default level is always valid");
    assert_eq!(settings.level(), default_log_level(false));
}

#[test]
fn log_level_option_is_normalized() {
    let options = LaunchOptions::parse(["--melonloader.loglevel", "WARNING"]);
    let config = LoaderConfig::resolve(&options, &host());
    assert_eq!(config.log_level(), "warn");
}
