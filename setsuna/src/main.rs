use anyhow::Result;

use setsuna::instance::{Instance, InstanceConfig};

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("SETSUNA_LOG", "info")
        .write_style_or("SETSUNA_LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    let config = InstanceConfig::from_env();
    log::info!(
        "starting setsuna server (runtime dir {})",
        config.runtime_dir.display()
    );

    let instance = Instance::create(config)?;
    instance.run()
}
