use envconfig::Envconfig;
use eyre::{Result, WrapErr};

use config::Config;
use handlers::collection::Faults;
use sync_common::{metrics, signal};

mod config;
mod handlers;

#[tokio::main]
async fn main() -> Result<()> {
    signal::init_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let faults = Faults::every(config.fail_every);
    let upstream = if config.seed {
        handlers::seeded(faults)
    } else {
        handlers::Upstream::empty(faults)
    };

    let recorder_handle = metrics::setup_metrics_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let app = handlers::app(upstream, Some(recorder_handle));

    let bind = config.bind();
    tracing::info!("serving mock upstream on {}", bind);
    tokio::select! {
        result = metrics::serve(app, &bind) => {
            result.wrap_err("failed to start sync-upstream-mock http server")?
        }
        _ = signal::shutdown() => {}
    }

    Ok(())
}
