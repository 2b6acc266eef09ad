// keg/src/cli/info.rs
// Contains the logic for the `info` command.

use clap::Args;
use colored::Colorize;
use keg_common::config::Config;
use keg_common::error::Result;
use keg_common::formulary::Formulary;
use keg_common::model::formula::Formula;
use keg_common::state::InstallStateStore;
use keg_core::select_artifact;
use prettytable::{format, Cell, Row, Table};
use tracing::debug;

#[derive(Args, Debug)]
pub struct Info {
    /// Formula to describe, optionally as `name@version`
    #[arg(value_name = "FORMULA[@VERSION]")]
    pub name: String,

    /// Report the artifact as if `--build-from-source` were given to install
    #[arg(long)]
    pub build_from_source: bool,
}

impl Info {
    pub fn run(&self, config: &Config) -> Result<i32> {
        debug!("Getting info for formula: {}", self.name);
        let formulary = Formulary::init_global(config)?;
        let target = formulary.parse_target(&self.name)?;
        let formula = formulary.lookup(&target.name, target.constraint.as_ref())?;

        print_formula_info(&formula);

        let choice = select_artifact(
            &formula,
            &config.platform_tag,
            self.build_from_source || config.build_from_source,
            &config.cellar_dir(),
        );
        println!(
            "\n{} {} on {}",
            "Would install:".bold(),
            choice,
            config.platform_tag
        );

        let state = InstallStateStore::from_config(config)?;
        let installed = state.versions(formula.name());
        if !installed.is_empty() {
            println!("\n{}", "Installed:".bold());
            for record in installed {
                println!(
                    "  {} {} ({}, {})",
                    record.version.green(),
                    record.keg_path.display(),
                    record.install_kind,
                    record.installed_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        let others: Vec<String> = formulary
            .versions(formula.name())
            .iter()
            .filter(|f| f.version_str_full() != formula.version_str_full())
            .map(|f| f.version_str_full())
            .collect();
        if !others.is_empty() {
            println!("\n{} {}", "Other versions:".bold(), others.join(", "));
        }
        Ok(0)
    }
}

fn print_formula_info(formula: &Formula) {
    println!(
        "{} {}, license: {}",
        formula.name().green().bold(),
        formula.version_str_full(),
        formula.license.as_deref().unwrap_or("N/A")
    );
    if let Some(desc) = &formula.desc {
        println!("{desc}");
    }
    println!("Homepage: {}", formula.homepage.as_deref().unwrap_or("N/A"));
    if formula.has_source() {
        println!("Source: {}", formula.url);
    }
    if let Some(head) = &formula.head {
        match &head.branch {
            Some(branch) => println!("HEAD: {} ({branch})", head.url),
            None => println!("HEAD: {}", head.url),
        }
    }

    if !formula.dependencies.is_empty() {
        println!("\n{}", "Dependencies:".bold());
        for dep in &formula.dependencies {
            println!("  - {} [{}]", dep, dep.tags);
        }
    }

    if !formula.bottles.is_empty() {
        println!("\n{}", "Bottles:".bold());
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Platform").style_spec("b"),
            Cell::new("Rebuild").style_spec("b"),
            Cell::new("Cellar").style_spec("b"),
        ]));
        for bottle in &formula.bottles {
            table.add_row(Row::new(vec![
                Cell::new(bottle.platform_tag.as_str()),
                Cell::new(&bottle.rebuild.to_string()),
                Cell::new(&bottle.cellar.to_string()),
            ]));
        }
        table.printstd();
    }
}
