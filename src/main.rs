//! droidrun - install, launch, and monitor sketches on Android devices
//!
//! This is the binary entry point. All logic lives in the library crates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use droidrun_core::logging;
use droidrun_device::{
    Adb, DeviceRegistry, EmulatorController, SdkEmulator, Settings, UnavailableEmulator,
};
use droidrun_runner::{BuildArtifact, ComponentKind, PrebuiltApk, Runner, RunnerStatus};

/// Install, launch, and monitor sketches on Android devices
#[derive(Parser, Debug)]
#[command(name = "droidrun")]
#[command(about = "Install, launch, and monitor sketches on Android devices", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices and emulators
    Devices,

    /// Install and launch a prebuilt sketch APK, then monitor it until Ctrl-C
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to the sketch APK
    apk: PathBuf,

    /// Package name the sketch was built under
    #[arg(long)]
    package: String,

    /// Class name of the main activity
    #[arg(long, default_value = "MainActivity")]
    main_class: String,

    /// Component kind the sketch was built as
    #[arg(long, value_enum, default_value_t = Component::App)]
    component: Component,

    /// Target the emulator instead of attached hardware
    #[arg(long)]
    emulator: bool,

    /// Target the wear form factor (boots the wear emulator)
    #[arg(long)]
    wear: bool,

    /// Disable accelerated graphics in the emulator
    #[arg(long)]
    no_gpu: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Component {
    App,
    Wallpaper,
    WatchFace,
    Vr,
}

impl From<Component> for ComponentKind {
    fn from(component: Component) -> Self {
        match component {
            Component::App => ComponentKind::App,
            Component::Wallpaper => ComponentKind::Wallpaper,
            Component::WatchFace => ComponentKind::WatchFace,
            Component::Vr => ComponentKind::Vr,
        }
    }
}

/// Status listener printing to the terminal
#[derive(Default)]
struct ConsoleStatus {
    halted: AtomicBool,
}

impl RunnerStatus for ConsoleStatus {
    fn notice(&self, message: &str) {
        println!("{}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("{}", message);
    }

    fn halt(&self) {
        println!("Sketch stopped.");
        self.halted.store(true, Ordering::Release);
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    logging::init()?;

    let args = Args::parse();
    let settings = Settings::load()?;
    let adb = Adb::locate(&settings)?;

    let emulator: Arc<dyn EmulatorController> =
        match SdkEmulator::locate(&settings, adb.clone()) {
            Ok(emulator) => Arc::new(emulator),
            Err(e) => {
                tracing::warn!("{}", e);
                Arc::new(UnavailableEmulator)
            }
        };
    let registry = DeviceRegistry::new(adb, emulator);

    match args.command {
        Command::Devices => {
            registry.refresh().await;
            let devices = registry.snapshot();
            if devices.is_empty() {
                println!("No devices attached.");
            } else {
                for device in &devices {
                    let kind = if device.is_emulator() { "emulator" } else { "device" };
                    println!("{}\t{}\t{}", device.id(), kind, device.name());
                }
            }
            registry.shutdown_all().await;
        }

        Command::Run(run) => {
            let build = Arc::new(PrebuiltApk {
                apk: run.apk,
                package: run.package,
                main_class: run.main_class,
                component: run.component.into(),
                wear: run.wear,
                accelerated: !run.no_gpu,
            });
            let status = Arc::new(ConsoleStatus::default());
            let runner = Runner::new(build.clone(), status, Arc::clone(&registry));

            let acquisition = if run.emulator {
                registry.acquire_emulator(build.is_wearable(), build.uses_accelerated_graphics())
            } else {
                registry.acquire_hardware()
            };

            let ok = runner
                .launch(acquisition, build.component_kind(), run.emulator)
                .await;
            if !ok {
                registry.shutdown_all().await;
                std::process::exit(1);
            }

            println!("Monitoring; press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;

            runner.close().await;
            registry.shutdown_all().await;
        }
    }

    Ok(())
}
