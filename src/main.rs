use tracing::{info_span, Level};

use cacheback::{init_settings, init_tracing, run_event_threads};

fn main() {
    // TODO start a watchdog process (that won't die when this process dies!)
    // which monitors this process and restarts it with the same arguments if it dies.

    init_tracing(Level::TRACE);

    let _span = info_span!("startup").entered();

    let settings = init_settings().expect("could not load config");

    let handles = run_event_threads(settings).expect("could not start event threads");

    for handle in handles {
        let _ = handle.join();
    }
}
