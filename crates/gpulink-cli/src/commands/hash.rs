//! System configuration hash.

use crate::HashArgs;
use anyhow::Result;

/// Runs the hash command.
pub fn run(args: HashArgs) -> Result<()> {
    let registry = super::load_registry(&args.device)?;
    println!("{}", registry.config_hash());
    Ok(())
}
