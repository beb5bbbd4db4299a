//! World and world backup commands.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use super::{format_size, Session};
use crate::core::World;

#[derive(Debug, Subcommand)]
pub enum WorldsCommands {
    /// Create an empty world
    CreateWorld(CreateWorldArgs),
    /// List worlds of an instance
    ListWorlds(InstanceArgs),
    /// Show details of one world
    InfoWorld(WorldArgs),
    /// Archive a world into the instance's backup directory
    BackupWorld(WorldArgs),
    /// Replace a world with the content of a backup archive
    RestoreWorld(RestoreArgs),
    /// Delete a world; its backups are kept
    RemoveWorld(WorldArgs),
    /// List backup archives, optionally of one world
    ListBackups(ListBackupsArgs),
}

#[derive(Debug, Args)]
pub struct CreateWorldArgs {
    /// Instance name
    pub name: String,
    /// World name
    pub world: String,
    /// Game system id
    pub system: String,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Debug, Args)]
pub struct InstanceArgs {
    /// Instance name
    pub name: String,
}

#[derive(Debug, Args)]
pub struct WorldArgs {
    /// Instance name
    pub name: String,
    /// World name
    pub world: String,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Instance name
    pub name: String,
    /// Backup archive to restore
    pub archive: PathBuf,
}

#[derive(Debug, Args)]
pub struct ListBackupsArgs {
    /// Instance name
    pub name: String,
    /// Only backups of this world
    pub world: Option<String>,
}

pub fn execute(session: &Session, cmd: WorldsCommands) -> Result<()> {
    let worlds = session.instances().worlds();
    match cmd {
        WorldsCommands::CreateWorld(args) => {
            let world = worlds.create(
                &args.name,
                &args.world,
                &args.system,
                args.description.as_deref(),
            )?;
            session.render(&world, |w| {
                println!("Created world '{}' ({}) in '{}'", w.name, args.system, args.name)
            })
        }
        WorldsCommands::ListWorlds(args) => {
            let list = worlds.list(&args.name)?;
            session.render(&list, |list| print_worlds(&args.name, list))
        }
        WorldsCommands::InfoWorld(args) => {
            let world = worlds.info(&args.name, &args.world)?;
            session.render(&world, print_world)
        }
        WorldsCommands::BackupWorld(args) => {
            let backup = worlds.backup(&args.name, &args.world)?;
            session.render(&backup, |b| {
                println!("Backed up '{}' to {}", b.world, b.path.display());
                println!("  Size: {}", format_size(b.size_bytes));
            })
        }
        WorldsCommands::RestoreWorld(args) => {
            let world = worlds.restore(&args.name, &args.archive)?;
            session.render(&world, |w| {
                println!(
                    "Restored world '{}' in '{}' from {}",
                    w.name,
                    args.name,
                    args.archive.display()
                )
            })
        }
        WorldsCommands::RemoveWorld(args) => {
            worlds.remove(&args.name, &args.world)?;
            println!("Removed world '{}' from '{}'", args.world, args.name);
            Ok(())
        }
        WorldsCommands::ListBackups(args) => {
            let backups = worlds.list_backups(&args.name, args.world.as_deref())?;
            session.render(&backups, |backups| {
                if backups.is_empty() {
                    println!("No backups found.");
                    return;
                }
                println!("{:<24} {:<26} {:>10}  {}", "WORLD", "CREATED", "SIZE", "FILE");
                for backup in backups {
                    println!(
                        "{:<24} {:<26} {:>10}  {}",
                        backup.world,
                        backup.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                        format_size(backup.size_bytes),
                        backup.path.display()
                    );
                }
            })
        }
    }
}

fn print_worlds(instance: &str, worlds: &[World]) {
    if worlds.is_empty() {
        println!("No worlds in '{}'.", instance);
        println!();
        println!("To create a world, run:");
        println!("  fim worlds create-world {} <world> <system>", instance);
        return;
    }
    println!("{:<24} {:<16} {:>10}  {}", "NAME", "SYSTEM", "SIZE", "NOTE");
    for world in worlds {
        println!(
            "{:<24} {:<16} {:>10}  {}",
            world.name,
            world.system.as_deref().unwrap_or("?"),
            format_size(world.size_bytes),
            world.manifest_error.as_deref().unwrap_or("")
        );
    }
}

fn print_world(world: &World) {
    println!("Name:        {}", world.name);
    println!("Title:       {}", world.title.as_deref().unwrap_or("-"));
    println!("System:      {}", world.system.as_deref().unwrap_or("-"));
    println!("Description: {}", world.description.as_deref().unwrap_or("-"));
    if let Some(at) = world.created_at {
        println!("Created:     {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Size:        {}", format_size(world.size_bytes));
    println!("Path:        {}", world.path.display());
    if let Some(problem) = &world.manifest_error {
        println!("Warning:     {}", problem);
    }
}
