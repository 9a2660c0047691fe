use anyhow::{Context, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{FuzzySelect, MultiSelect};

/// Show a fuzzy picker and return the selected item's index.
pub fn pick(prompt: &str, items: &[String]) -> Result<usize> {
    if items.is_empty() {
        anyhow::bail!("nothing to pick from");
    }

    FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(items)
        .interact()
        .context("selection cancelled")
}

/// Checkbox picker; space toggles, enter confirms. Empty selection is an error.
pub fn pick_many(prompt: &str, items: &[String]) -> Result<Vec<usize>> {
    if items.is_empty() {
        anyhow::bail!("nothing to pick from");
    }

    let picked = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(items)
        .interact()
        .context("selection cancelled")?;
    if picked.is_empty() {
        anyhow::bail!("nothing selected");
    }
    Ok(picked)
}
