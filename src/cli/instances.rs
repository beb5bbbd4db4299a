//! Instance lifecycle and settings commands.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;

use super::Session;
use crate::core::{BulkConfig, Credentials, Instance, InstanceConfig};

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Instance name, also used as directory and container name
    pub name: String,
    /// Application version (image tag)
    #[arg(long)]
    pub version: String,
    /// Host port for the web interface
    #[arg(long)]
    pub port: u16,
    /// Admin key for the instance
    #[arg(long)]
    pub admin_key: Option<String>,
    /// Host port for TLS through a reverse proxy
    #[arg(long)]
    pub proxy_port: Option<u16>,
    /// Custom container image, used instead of the repository tagged with --version
    #[arg(long)]
    pub image: Option<String>,
    /// Extra container environment (KEY=VALUE, repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct CreateFromConfigArgs {
    /// JSON file with an "instances" map of name to version, port and environment
    pub file: PathBuf,
}

#[derive(Debug, Args)]
pub struct NameArgs {
    /// Instance name
    pub name: String,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    /// Instance name
    pub name: String,
    /// Stop a running instance first and continue past failing steps
    #[arg(long, short)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Instance name
    pub name: String,
    /// Target application version
    #[arg(long)]
    pub version: String,
}

#[derive(Debug, Args)]
pub struct SetBaseDirArgs {
    /// Directory holding all instances and the shared area
    #[arg(long)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct SetCredentialsArgs {
    #[arg(long)]
    pub username: String,
    #[arg(long)]
    pub password: String,
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

pub fn execute_create(session: &Session, args: CreateArgs) -> Result<()> {
    let mut config = InstanceConfig::new(args.name, args.version, args.port);
    config.admin_key = args.admin_key;
    config.proxy_port = args.proxy_port;
    config.image = args.image;
    config.environment = args.env;

    let instance = session.instances().create(config)?;
    session.render(&instance, |i| {
        println!("Created instance '{}' on port {}", i.name, i.port);
        println!("  Directory: {}", i.root_dir().display());
        println!();
        println!("To start it, run:");
        println!("  fim start {}", i.name);
    })
}

pub fn execute_create_from_config(session: &Session, args: CreateFromConfigArgs) -> Result<()> {
    let config = BulkConfig::load(&args.file)?;
    let created = session.instances().create_from_config(config)?;
    session.render(&created, |created| {
        if created.is_empty() {
            println!("No instances defined in {}", args.file.display());
            return;
        }
        println!("Created {} instance(s):", created.len());
        print_table(created);
    })
}

pub fn execute_list(session: &Session) -> Result<()> {
    let instances = session.instances().list()?;
    session.render(&instances, |instances| {
        if instances.is_empty() {
            println!("No instances found.");
            println!();
            println!("To create an instance, run:");
            println!("  fim create <name> --version <version> --port <port>");
            return;
        }
        print_table(instances);
    })
}

pub fn execute_start(session: &Session, args: NameArgs) -> Result<()> {
    let instance = session.instances().start(&args.name)?;
    session.render(&instance, |i| {
        println!("Instance '{}' is running at http://localhost:{}", i.name, i.port)
    })
}

pub fn execute_stop(session: &Session, args: NameArgs) -> Result<()> {
    let instance = session.instances().stop(&args.name)?;
    session.render(&instance, |i| println!("Instance '{}' is {}", i.name, i.status))
}

pub fn execute_delete(session: &Session, args: DeleteArgs) -> Result<()> {
    let report = session.instances().delete(&args.name, args.force)?;
    let failures: Vec<String> = report
        .failures
        .iter()
        .map(|(step, error)| format!("{}: {}", step, error))
        .collect();
    session.render(
        &serde_json::json!({
            "name": report.name,
            "deleted": true,
            "partial_failures": failures,
        }),
        |_| {
            if failures.is_empty() {
                println!("Deleted instance '{}'", report.name);
            } else {
                println!(
                    "Deleted instance '{}' with {} partial failure(s):",
                    report.name,
                    failures.len()
                );
                for failure in &failures {
                    println!("  - {}", failure);
                }
            }
        },
    )
}

pub fn execute_status(session: &Session, args: NameArgs) -> Result<()> {
    let instance = session.instances().status(&args.name)?;
    session.render(&instance, |i| {
        println!("Name:       {}", i.name);
        println!("Status:     {}", i.status);
        println!("Version:    {}", i.version);
        if let Some(image) = &i.custom_image {
            println!("Image:      {}", image);
        }
        println!("Port:       {}", i.port);
        if let Some(proxy) = i.proxy_port {
            println!("Proxy port: {}", proxy);
        }
        println!("Admin key:  {}", if i.admin_key_ref.is_some() { "set" } else { "none" });
        println!("Created:    {}", i.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("Directory:  {}", i.root_dir().display());
    })
}

pub fn execute_migrate(session: &Session, args: MigrateArgs) -> Result<()> {
    let instance = session.instances().migrate(&args.name, &args.version)?;
    session.render(&instance, |i| {
        println!("Instance '{}' now uses version {} ({})", i.name, i.version, i.status)
    })
}

pub fn execute_history(session: &Session, args: NameArgs) -> Result<()> {
    let events = session.instances().history(&args.name)?;
    session.render(&events, |events| {
        if events.is_empty() {
            println!("No history for '{}'.", args.name);
            return;
        }
        println!("{:<32} {:<12} {}", "TIME", "EVENT", "DETAILS");
        for event in events {
            println!(
                "{:<32} {:<12} {}",
                event.event_time,
                event.event_type,
                event.details.as_deref().unwrap_or("")
            );
        }
    })
}

pub fn execute_set_base_dir(session: &Session, args: SetBaseDirArgs) -> Result<()> {
    if args.base_dir.as_os_str().is_empty() {
        bail!("Base directory must not be empty");
    }
    let base_dir = if args.base_dir.is_absolute() {
        args.base_dir
    } else {
        std::env::current_dir()?.join(args.base_dir)
    };

    let settings = session.settings.clone().with_base_dir(&base_dir);
    session.database.save_settings(&settings)?;
    session.render(&serde_json::json!({ "base_dir": base_dir }), |_| {
        println!("Base directory set to {}", base_dir.display());
        println!("Existing instances keep the directory they were created in.");
    })
}

pub fn execute_set_credentials(session: &Session, args: SetCredentialsArgs) -> Result<()> {
    if args.username.trim().is_empty() {
        bail!("Username must not be empty");
    }
    let credentials = Credentials {
        username: args.username,
        password: args.password,
    };
    let mut settings = session.settings.clone();
    settings.credentials = Some(credentials.clone());
    session.database.save_settings(&settings)?;
    session.render(&credentials_view(&credentials), |_| {
        println!(
            "Credentials for '{}' saved; they are passed to containers created from now on.",
            credentials.username
        );
    })
}

/// What the CLI shows of saved credentials; the password never leaves the store
fn credentials_view(credentials: &Credentials) -> serde_json::Value {
    serde_json::json!({ "username": credentials.username })
}

fn print_table(instances: &[Instance]) {
    println!(
        "{:<20} {:<10} {:<10} {:<7} {:<7}",
        "NAME", "STATUS", "VERSION", "PORT", "PROXY"
    );
    for instance in instances {
        println!(
            "{:<20} {:<10} {:<10} {:<7} {:<7}",
            instance.name,
            instance.status.label(),
            instance.version,
            instance.port,
            instance
                .proxy_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}
