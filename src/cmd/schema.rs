//! Print the RPC operation catalog (`treenq schema`).

use anyhow::{Context, Result};
use treenq::platform::api;

pub fn cmd_schema(pretty: bool) -> Result<()> {
    let catalog = api::catalog();
    let json = if pretty {
        serde_json::to_string_pretty(&catalog)
    } else {
        serde_json::to_string(&catalog)
    }
    .context("Failed to serialize operation catalog")?;
    println!("{}", json);
    Ok(())
}
