use tether_cli::{Result, cli, logger};

fn main() -> Result<()> {
    logger::init();
    let code = cli::run()?;
    log::logger().flush();
    std::process::exit(code);
}
