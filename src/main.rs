use anyhow::Result;

fn main() -> Result<()> {
    modstage::cli::run()
}
