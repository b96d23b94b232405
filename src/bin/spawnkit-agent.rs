use anyhow::Result;

fn main() -> Result<()> {
    env_logger::init();
    spawnkit::cli::run()
}
