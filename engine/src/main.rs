//! Quasar engine entry point

use common::config::{EngineConfig, EnvOverrides};
use engine::app::App;
use engine::events::EventEmitter;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;
    let env = EnvOverrides::from_env();
    info!(?env, "engine configuration loaded");

    let (emitter, writer) = EventEmitter::new();
    let writer_join = writer.spawn_stdout();

    let app = App::start(config, &env, emitter)?;

    // Commands until EOF, then a clean teardown.
    app.run_stdin_loop();
    app.shutdown();

    let _ = writer_join.join();
    Ok(())
}
