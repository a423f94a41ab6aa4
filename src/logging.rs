use anyhow::Result;
use tracing_subscriber::fmt;

/// Progress goes to stderr so reports printed on stdout stay parseable.
pub fn init(verbose: bool) -> Result<()> {
    if !verbose {
        return Ok(());
    }
    let _ = fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .try_init();
    Ok(())
}
