mod core;
mod utils;
mod workers;

use crate::utils::data_dir;
use crate::utils::sos::SignalOfStop;
use anyhow::Context;
use workers::args::{Args, Command};
use workers::settings::Settings;

fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory (must happen before any persistence access)
    data_dir::init(args.conf.as_deref())?;

    let mut settings = Settings::load(&data_dir::get().join("config.toml"))?;
    utils::log_file::init(settings.verbosity(args.verbose), &data_dir::log_file())?;

    match &args.command {
        Command::Tracker(t) => settings.apply_tracker_args(t),
        Command::Peer(p) => settings.apply_peer_args(p),
    }

    // A few event-loop threads multiplex every connection; disk and crypto
    // work goes to the blocking pool.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.reactor_threads.max(1))
        .max_blocking_threads(settings.worker_pool_size.max(1) * 2)
        .thread_name("p2pshare")
        .enable_all()
        .build()
        .context("build runtime")?;

    runtime.block_on(async move {
        let sos = SignalOfStop::new();

        // Ctrl+C handler
        let sos_clone = sos.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            sos_clone.cancel();
        });

        match args.command {
            Command::Tracker(_) => workers::tracker::run(settings, sos).await,
            Command::Peer(_) => workers::peer::run(settings, sos).await,
        }
    })
}
