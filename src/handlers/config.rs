use crate::cli::ConfigAction;
use anyhow::Result;
use console::{Term, style};
use distroget::config::ConfigManager;
use std::process;

pub async fn handle_config(config_manager: &ConfigManager, action: ConfigAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        ConfigAction::Show { section } => {
            let config = config_manager.config();
            let (title, content) = match section.as_deref() {
                Some("general") => (
                    format!("{} General configuration:", style("🔧").cyan()),
                    toml::to_string_pretty(&config.general)?,
                ),
                Some("retry") => (
                    format!("{} Retry configuration:", style("🔁").cyan()),
                    toml::to_string_pretty(&config.retry)?,
                ),
                Some("proxmox") => (
                    format!("{} Proxmox configuration:", style("🖥").cyan()),
                    toml::to_string_pretty(&config.proxmox)?,
                ),
                Some(s) => {
                    term.write_line(&format!("{} Unknown section: {}", style("❌").red(), s))?;
                    process::exit(1);
                }
                None => (
                    format!("{} Current configuration:", style("⚙️").cyan()),
                    toml::to_string_pretty(config)?,
                ),
            };

            term.write_line(&title)?;
            term.write_line(&format!("{}", style(config_manager.config_file().display()).dim()))?;
            term.write_line("")?;
            term.write_line(&content)?;
        }

        ConfigAction::Validate => {
            term.write_line(&format!(
                "{} Validating configuration...",
                style("🔍").cyan()
            ))?;

            match config_manager.validate() {
                Ok(()) => {
                    term.write_line(&format!("{} Configuration is valid", style("✅").green()))?;
                }
                Err(e) => {
                    term.write_line(&format!(
                        "{} Configuration validation failed:",
                        style("❌").red()
                    ))?;
                    term.write_line(&format!("   {}", e))?;
                    process::exit(1);
                }
            }
        }

        ConfigAction::Sample => {
            let sample_file = config_manager.create_sample_config()?;
            term.write_line(&format!(
                "{} Sample configuration created at: {:?}",
                style("✅").green(),
                sample_file
            ))?;
        }
    }
    Ok(())
}
