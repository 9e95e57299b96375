/// Interactive selection of nodes, pods and ports
use anyhow::{Context, Result};
use dialoguer::{Input, Select};

use crate::utils::{parse_port, PortPair};

/// Let the operator pick one of `items`
pub fn select(prompt: &str, items: &[String]) -> Result<String> {
    if items.is_empty() {
        anyhow::bail!("Nothing to choose from for: {}", prompt);
    }

    let index = Select::new()
        .with_prompt(prompt)
        .items(items)
        .default(0)
        .interact_opt()
        .context("Failed to read selection")?
        .context("Selection cancelled")?;

    Ok(items[index].clone())
}

/// Ask for a local port and the pod port it maps to
///
/// The pod port defaults to the local port.
pub fn port_pair() -> Result<PortPair> {
    let local = port("Local port", None)?;
    let remote = port("Pod port", Some(local))?;
    Ok(PortPair::new(local, remote))
}

fn port(prompt: &str, default: Option<u16>) -> Result<u16> {
    let mut input = Input::<String>::new()
        .with_prompt(prompt)
        .validate_with(|value: &String| -> std::result::Result<(), String> {
            parse_port(value).map(|_| ()).map_err(|e| e.to_string())
        });
    if let Some(default) = default {
        input = input.default(default.to_string());
    }

    let value = input.interact_text().context("Failed to read port")?;
    Ok(parse_port(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_from_nothing_fails_without_prompting() {
        let err = select("Select a node", &[]).unwrap_err();
        assert!(err.to_string().contains("Select a node"));
    }
}
