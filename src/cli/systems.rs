//! Content package commands.

use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Subcommand};

use super::Session;
use crate::core::ContentManager;
use crate::fetch::HttpFetcher;

#[derive(Debug, Subcommand)]
pub enum SystemsCommands {
    /// Install a package from an archive or manifest URL
    InstallSystem(InstallArgs),
    /// List installed packages
    ListSystems(InstanceArgs),
    /// Show details of an installed package
    InfoSystem(PackageArgs),
    /// Remove an installed package
    RemoveSystem(PackageArgs),
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Instance name
    pub name: String,
    /// Archive URL, or manifest URL with a `download` field
    pub url: String,
}

#[derive(Debug, Args)]
pub struct InstanceArgs {
    /// Instance name
    pub name: String,
}

#[derive(Debug, Args)]
pub struct PackageArgs {
    /// Instance name
    pub name: String,
    /// Package id
    pub id: String,
}

pub fn execute(session: &Session, cmd: SystemsCommands) -> Result<()> {
    let content = session
        .instances()
        .content(Arc::new(HttpFetcher::new()));
    match cmd {
        SystemsCommands::InstallSystem(args) => execute_install(session, &content, args),
        SystemsCommands::ListSystems(args) => execute_list(session, &content, args),
        SystemsCommands::InfoSystem(args) => execute_info(session, &content, args),
        SystemsCommands::RemoveSystem(args) => {
            content.remove(&args.name, &args.id)?;
            println!("Removed package '{}' from '{}'", args.id, args.name);
            Ok(())
        }
    }
}

fn execute_install(session: &Session, content: &ContentManager, args: InstallArgs) -> Result<()> {
    let package = content.install(&args.name, &args.url)?;
    session.render(&package, |p| {
        println!("Installed '{}' into '{}'", p.id, args.name);
        if let Some(version) = &p.version {
            println!("  Version: {}", version);
        }
    })
}

fn execute_list(session: &Session, content: &ContentManager, args: InstanceArgs) -> Result<()> {
    let packages = content.list(&args.name)?;
    session.render(&packages, |packages| {
        if packages.is_empty() {
            println!("No packages installed in '{}'.", args.name);
            return;
        }
        println!("{:<24} {:<12} {}", "ID", "VERSION", "TITLE");
        for package in packages {
            println!(
                "{:<24} {:<12} {}",
                package.id,
                package.version.as_deref().unwrap_or("-"),
                package.title.as_deref().unwrap_or("")
            );
        }
    })
}

fn execute_info(session: &Session, content: &ContentManager, args: PackageArgs) -> Result<()> {
    let package = content.info(&args.name, &args.id)?;
    session.render(&package, |p| {
        println!("Id:        {}", p.id);
        println!("Title:     {}", p.title.as_deref().unwrap_or("-"));
        println!("Version:   {}", p.version.as_deref().unwrap_or("-"));
        println!("Source:    {}", p.source_url.as_deref().unwrap_or("-"));
        if let Some(at) = p.installed_at {
            println!("Installed: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        println!("Path:      {}", p.path.display());
    })
}
