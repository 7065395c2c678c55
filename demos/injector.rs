//! Resolution hook injector
//!
//! Waits for the target to start, optionally writes the known width/height
//! cells directly, then loads the payload module into it.
//!
//! ```bash
//! cargo build --release --target i686-pc-windows-msvc
//! cargo build --release --example injector --target i686-pc-windows-msvc
//! injector.exe --payload res_hook_rs.dll
//! ```

#[cfg(windows)]
mod app {
    use std::path::PathBuf;
    use std::process::ExitCode;
    use std::time::Duration;

    use clap::Parser;
    use res_hook_rs::config::{CONFIG_FILE, EngineConfig};
    use res_hook_rs::inject::{self, Win32Remote};
    use res_hook_rs::process::{self, TargetProcess, wait_for};
    use res_hook_rs::signal::CancelToken;
    use res_hook_rs::{apply_static_patch, logging};
    use tracing::{error, info, warn};

    #[derive(Parser)]
    #[command(name = "injector")]
    #[command(about = "Load the resolution hook into a running game")]
    struct Args {
        /// Payload module to load
        #[arg(short, long, default_value = "res_hook_rs.dll")]
        payload: PathBuf,

        /// Target executable; defaults to the config's `[target] exe`
        #[arg(short, long)]
        target: Option<String>,

        /// Configuration file
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,

        /// Write the static width/height cells before injecting
        #[arg(long)]
        patch: bool,

        /// Skip injection (with --patch: patch only)
        #[arg(long)]
        no_inject: bool,

        /// Loader thread timeout in milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    }

    fn patch(target: &TargetProcess, config: &EngineConfig) {
        let Some(cells) = config.static_cells() else {
            warn!("No static cells configured, skipping patch");
            return;
        };
        let memory = target.memory();
        match apply_static_patch(&memory, target.base, cells, &config.settings) {
            Ok(()) => info!(
                "Patched {}x{} into {}",
                config.settings.width, config.settings.height, target.name
            ),
            Err(e) => error!("Patch failed: {}", e),
        }
    }

    pub fn main() -> ExitCode {
        logging::init_stderr();
        let args = Args::parse();

        let config = EngineConfig::load_or_default(&args.config);
        let exe = args.target.clone().unwrap_or_else(|| config.target.exe.clone());

        info!("Waiting for {}...", exe);
        let target = match wait_for(&config.wait_policy(), &CancelToken::new(), || process::locate(&exe)) {
            Ok(target) => target,
            Err(e) => {
                error!("Could not attach to {}: {}", exe, e);
                return ExitCode::FAILURE;
            }
        };
        info!("Found {} (pid {}) at {}", target.name, target.pid, target.base);

        if args.patch && config.settings.enabled {
            patch(&target, &config);
        }
        if args.no_inject {
            return ExitCode::SUCCESS;
        }

        let payload = match args.payload.canonicalize() {
            Ok(path) => path,
            Err(e) => {
                error!("Payload {} not usable: {}", args.payload.display(), e);
                return ExitCode::FAILURE;
            }
        };

        let remote = Win32Remote::new(&target);
        match inject::inject(&remote, &payload, Duration::from_millis(args.timeout_ms)) {
            Ok(code) => {
                info!("Payload loaded (module {:#x})", code);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Injection failed: {}", e);
                ExitCode::FAILURE
            }
        }
    }
}

#[cfg(windows)]
fn main() -> std::process::ExitCode {
    app::main()
}

#[cfg(not(windows))]
fn main() {
    eprintln!("injector only runs on Windows");
}
