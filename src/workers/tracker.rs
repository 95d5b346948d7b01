//! Tracker process: serve the registry, enrollment and discovery until
//! stopped.

use crate::core::connection::pool::WorkerPool;
use crate::core::tracker::Tracker;
use crate::utils::data_dir;
use crate::utils::sos::SignalOfStop;
use crate::workers::settings::Settings;
use anyhow::Result;

pub async fn run(settings: Settings, sos: SignalOfStop) -> Result<()> {
    let config = settings.tracker_config(data_dir::ca_dir());
    let pool = WorkerPool::new(settings.worker_pool_size);
    let tracker = Tracker::start(config, pool, sos).await?;
    println!(
        "Tracker up: registry {} enrollment {} (root certificate in {})",
        tracker.registry_addr,
        tracker.enroll_addr,
        data_dir::ca_dir().display()
    );
    tracker.wait().await;
    Ok(())
}
