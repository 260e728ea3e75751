//! Evolution pipeline commands: `evolve evolution <stage> <project>`.

use anyhow::Result;

use evolve::config::Config;
use evolve::evolution::{EvolutionPipeline, PromotionRecord, PromotionStage};

use super::super::EvolutionCommands;
use super::label;

pub async fn cmd_evolution(config: &Config, command: EvolutionCommands) -> Result<()> {
    config.ensure_directories()?;
    let pipeline = EvolutionPipeline::new(config);

    let record = match command {
        EvolutionCommands::Status { project } => {
            let status = pipeline.status(&project)?;
            println!(
                "{}: project {}, stage {}",
                console::style(&status.project).bold(),
                label(&status.project_status),
                label(&status.stage)
            );
            if let Some(record) = &status.record {
                print_record(record);
            }
            return Ok(());
        }
        EvolutionCommands::Deploy { project } => pipeline.deploy(&project).await?,
        EvolutionCommands::Validate { project } => pipeline.validate(&project).await?,
        EvolutionCommands::Integrate { project } => pipeline.integrate(&project).await?,
        EvolutionCommands::Rollback { project } => pipeline.rollback(&project).await?,
    };

    print_record(&record);
    if record.stage == PromotionStage::Failed {
        let reason = record
            .last_outcome()
            .map(|o| o.message.clone())
            .unwrap_or_default();
        anyhow::bail!("Stage failed for {}: {}", record.project, reason);
    }
    Ok(())
}

fn print_record(record: &PromotionRecord) {
    let stage = label(&record.stage);
    let styled = match record.stage {
        PromotionStage::Failed => console::style(stage).red().bold(),
        PromotionStage::RolledBack => console::style(stage).yellow(),
        _ => console::style(stage).green(),
    };
    println!("Promotion {} ({}): {}", record.id, record.project, styled);
    if let Some(baseline) = &record.baseline {
        println!("  baseline    {}", baseline);
    }
    if let Some(rev) = &record.deployed_revision {
        println!("  deployed    {}", rev);
    }
    if let Some(rev) = &record.integrated_revision {
        println!("  integrated  {}", rev);
    }
    for outcome in &record.outcomes {
        let mark = if outcome.passed {
            console::style("✓").green()
        } else {
            console::style("✗").red()
        };
        println!(
            "  {} {:<10} {}",
            mark,
            outcome.stage.as_str(),
            outcome.message
        );
    }
    if let Some(validation) = &record.validation {
        for check in validation.failures() {
            println!("    {} {}", console::style(&check.check).dim(), check.message);
        }
    }
}
