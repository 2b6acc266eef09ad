// keg/src/cli/list.rs
use std::collections::BTreeMap;

use clap::Args;
use colored::Colorize;
use keg_common::config::Config;
use keg_common::error::Result;
use keg_common::state::{InstallRecord, InstallStateStore};
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct List {
    /// Show every installed version, not just the newest for each name
    #[arg(long)]
    pub versions: bool,
}

impl List {
    pub fn run(&self, config: &Config) -> Result<i32> {
        let state = InstallStateStore::from_config(config)?;
        let mut by_name: BTreeMap<String, Vec<InstallRecord>> = BTreeMap::new();
        for record in state.list_installed() {
            by_name.entry(record.name.clone()).or_default().push(record);
        }
        if by_name.is_empty() {
            println!("{}", "0 formulae installed".yellow());
            return Ok(0);
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        let version_header = if self.versions { "Versions" } else { "Version" };
        table.add_row(Row::new(vec![
            Cell::new("Name").style_spec("b"),
            Cell::new(version_header).style_spec("b"),
            Cell::new("Kind").style_spec("b"),
            Cell::new("Installed").style_spec("b"),
        ]));

        let formula_count = by_name.len();
        for (name, mut records) in by_name {
            // Newest first; HEAD installs have no semver and sort last.
            records.sort_by(|a, b| b.semver().cmp(&a.semver()));
            let newest = &records[0];
            let versions = if self.versions {
                records
                    .iter()
                    .map(|r| r.version.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                newest.version.clone()
            };
            let requested = if newest.installed_on_request {
                ""
            } else {
                " (dependency)"
            };
            table.add_row(Row::new(vec![
                Cell::new(&name).style_spec("Fb"),
                Cell::new(&versions),
                Cell::new(&format!("{}{}", newest.install_kind, requested)),
                Cell::new(&newest.installed_at.format("%Y-%m-%d %H:%M").to_string()),
            ]));
        }
        table.printstd();
        println!("{}", format!("{} formulae installed", formula_count).bold());
        Ok(0)
    }
}
