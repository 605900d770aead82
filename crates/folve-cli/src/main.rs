//! folve - a FUSE filesystem that convolves audio files on the fly.
//!
//! Mounts a read-only view of a music directory in which every FLAC, WAV
//! and Ogg Vorbis file appears convolved with a user-supplied FIR filter,
//! re-encoded as FLAC while it is being read. Filters are selected at
//! runtime through a small HTTP status page.

mod fuse;
mod status;

use anyhow::Context;
use clap::Parser;
use folve_engine::{FolveFilesystem, FolveOptions};
use fuser::MountOption;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

#[derive(Parser)]
#[command(
    name = "folve",
    version,
    about = "FUSE filesystem that convolves audio files on the fly",
    long_about = None
)]
struct Cli {
    /// Convolver configuration directory; repeatable, select on the HTTP
    /// status page.
    #[arg(short = 'c', value_name = "CFG-DIR")]
    config_dir: Vec<PathBuf>,

    /// Port to run the HTTP status server on.
    #[arg(short = 'p', value_name = "PORT")]
    port: Option<u16>,

    /// Seconds between refreshes of the status page; -1 disables.
    #[arg(
        short = 'r',
        value_name = "REFRESH",
        default_value_t = 10,
        allow_hyphen_values = true
    )]
    refresh: i64,

    /// Gapless convolving of alphabetically adjacent files.
    #[arg(short = 'g')]
    gapless: bool,

    /// Debug logging; also enables the debug toggle in the UI.
    #[arg(short = 'D')]
    debug: bool,

    /// Operate in foreground. folve always runs in the foreground; the
    /// flag is accepted for compatibility.
    #[arg(short = 'f')]
    foreground: bool,

    /// Other generic mount option handed to FUSE; repeatable.
    #[arg(short = 'o', value_name = "MNT-OPT")]
    mount_option: Vec<String>,

    /// High volume FUSE debug log; implies -f.
    #[arg(short = 'd')]
    fuse_debug: bool,

    /// Factor by which the reported size of convolving files initially
    /// over-estimates the output.
    #[arg(short = 'O', value_name = "FACTOR", default_value_t = 1.25)]
    oversize_factor: f64,

    /// Directory with the original audio files.
    #[arg(value_name = "ORIGINAL-DIR")]
    underlying_dir: PathBuf,

    /// Mount point for the convolved view.
    #[arg(value_name = "MOUNT-POINT")]
    mount_point: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    let initial_level = if cli.debug || cli.fuse_debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(initial_level));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.foreground || cli.fuse_debug {
        tracing::debug!("foreground operation requested; folve always runs in the foreground");
    }

    let fs = FolveFilesystem::new(FolveOptions {
        underlying_dir: cli.underlying_dir.clone(),
        config_dirs: cli.config_dir.clone(),
        gapless_processing: cli.gapless,
        debug_ui_enabled: cli.debug,
        file_oversize_factor: cli.oversize_factor,
        ..FolveOptions::default()
    })
    .context("setting up the filesystem")?;
    fs.setup_initial_config();

    let _status_server = match cli.port {
        Some(port) => {
            let toggle_handle = reload_handle;
            let debug_toggle: status::DebugToggle = Box::new(move |enabled| {
                let directive = if enabled { "debug" } else { "info" };
                if let Err(e) = toggle_handle.reload(EnvFilter::new(directive)) {
                    tracing::warn!(error = %e, "could not switch log level");
                }
            });
            Some(status::StatusServer::start(
                Arc::clone(&fs),
                port,
                cli.refresh,
                debug_toggle,
            )?)
        }
        None => {
            if fs.config_dirs().len() > 2 {
                tracing::warn!(
                    "multiple filter configurations but no HTTP status port; \
                     filters can only be switched via the HTTP interface; add -p <port>"
                );
            }
            None
        }
    };

    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("folve".to_string()),
        MountOption::AutoUnmount,
    ];
    for opt in &cli.mount_option {
        options.push(MountOption::CUSTOM(opt.clone()));
    }

    tracing::info!(
        underlying = %fs.underlying_dir().display(),
        mount_point = %cli.mount_point.display(),
        "mounting"
    );
    fuser::mount2(fuse::FolveFuse::new(Arc::clone(&fs)), &cli.mount_point, &options)
        .context("mounting the filesystem")?;

    fs.shutdown();
    tracing::info!("exiting");
    Ok(())
}
