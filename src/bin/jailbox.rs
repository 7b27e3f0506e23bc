use anyhow::Result;

fn main() -> Result<()> {
    env_logger::init();
    jailbox::cli::run()
}
