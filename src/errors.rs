use color_eyre::Result;
use std::panic;

/// Installs the color-eyre report handler and a panic hook that also sends
/// the report through `tracing`, so panics of a detached agent end up in
/// its log file.
pub fn init_errors() -> Result<()> {
    let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .into_hooks();
    eyre_hook.install()?;

    panic::set_hook(Box::new(move |panic_info| {
        let report = panic_hook.panic_report(panic_info).to_string();
        error!("{}", strip_ansi_escapes::strip_str(&report));
        eprintln!("{report}");
    }));
    Ok(())
}
