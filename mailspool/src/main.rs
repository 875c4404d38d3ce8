use std::sync::{atomic::AtomicBool, Arc};

use structopt::StructOpt;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // SIGINT/SIGTERM flip the flag; a 1 Hz watcher inside run() turns it
    // into an orderly stop.
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone())?;

    mailspool::run(&mailspool::Opt::from_args(), stop)
}
