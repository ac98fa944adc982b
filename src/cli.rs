use crate::{
    config::AppConfig,
    deploy::{DeployOptions, DeployReport, Deployer},
    library::Library,
    linking::{ExternalChange, MethodRegistry, PurgeReport, SupportContext},
    logging,
    order::{sort_mods, NoRuleLookup},
};
use anyhow::{bail, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GlobalOptions {
    format: OutputFormat,
    verbose: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Deploy { reset: bool },
    Purge,
    Order,
    Check,
    Methods,
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modstage v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config = AppConfig::load_or_create()?;
            logging::init(&config.log_path(), global.verbose)?;
            run_command(&config, command, global.format)
        }
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let (global, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok((global, CliCommand::Help));
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    let command = match head.as_str() {
        "deploy" => {
            let mut reset = false;
            for arg in rest {
                match arg.as_str() {
                    "--reset" => reset = true,
                    other => bail!("Unknown deploy option: {other}"),
                }
            }
            CliCommand::Deploy { reset }
        }
        "purge" => CliCommand::Purge,
        "order" => CliCommand::Order,
        "check" => CliCommand::Check,
        "methods" => CliCommand::Methods,
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        other => bail!("Unknown command: {other} (see 'modstage help')"),
    };
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut global = GlobalOptions {
        format: OutputFormat::Text,
        verbose: false,
    };
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            global.format = parse_format(value)?;
            continue;
        }
        match arg.as_str() {
            "--format" => {
                let Some(value) = iter.next() else {
                    bail!("--format requires a value");
                };
                global.format = parse_format(value)?;
            }
            "--verbose" | "-v" => global.verbose = true,
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((global, tokens))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    OutputFormat::parse(value)
        .ok_or_else(|| anyhow::anyhow!("Unknown format: {value} (use 'text' or 'json')"))
}

fn run_command(config: &AppConfig, command: CliCommand, format: OutputFormat) -> Result<()> {
    let registry = MethodRegistry::with_defaults();
    match command {
        CliCommand::Deploy { reset } => {
            let library = Library::load_or_create(&config.data_dir)?;
            let deployer = Deployer::from_config(config, &registry)?;
            let report = deployer.deploy_with_options(&library, &DeployOptions { reset })?;
            print_deploy_report(&report, format)
        }
        CliCommand::Purge => {
            let deployer = Deployer::from_config(config, &registry)?;
            let report = deployer.purge()?;
            print_purge_report(&report, format)
        }
        CliCommand::Order => {
            let library = Library::load_or_create(&config.data_dir)?;
            let outcome = sort_mods(&library.enabled_mods(), &NoRuleLookup);
            match format {
                OutputFormat::Json => print_json(&OrderOutput {
                    order: &outcome.order,
                    cycles: &outcome.cycles,
                }),
                OutputFormat::Text => {
                    for (index, id) in outcome.order.iter().enumerate() {
                        println!("{:>4}  {id}", index + 1);
                    }
                    for cycle in &outcome.cycles {
                        println!("cycle: {}", cycle.join(" -> "));
                    }
                    Ok(())
                }
            }
        }
        CliCommand::Check => {
            let deployer = Deployer::from_config(config, &registry)?;
            let changes = deployer.check()?;
            print_changes(&changes, format)
        }
        CliCommand::Methods => list_methods(config, &registry, format),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

#[derive(Serialize)]
struct OrderOutput<'a> {
    order: &'a [String],
    cycles: &'a [Vec<String>],
}

#[derive(Serialize)]
struct MethodItem {
    id: &'static str,
    name: &'static str,
    supported: bool,
    reason: Option<String>,
}

fn list_methods(config: &AppConfig, registry: &MethodRegistry, format: OutputFormat) -> Result<()> {
    let ctx = SupportContext {
        game_id: String::new(),
        mod_type_id: String::new(),
        staging_root: config.staging_root.clone(),
        destination_root: config.game_root.clone(),
    };
    let mut items = Vec::new();
    for id in registry.ids() {
        let method = registry.get(id)?;
        let reason = method.is_supported(&ctx).map(|reason| reason.description);
        items.push(MethodItem {
            id,
            name: method.name(),
            supported: reason.is_none(),
            reason,
        });
    }
    match format {
        OutputFormat::Json => print_json(&items),
        OutputFormat::Text => {
            for item in &items {
                match &item.reason {
                    None => println!("{:<10} {}  [supported]", item.id, item.name),
                    Some(reason) => println!("{:<10} {}  [unavailable: {reason}]", item.id, item.name),
                }
            }
            Ok(())
        }
    }
}

fn print_deploy_report(report: &DeployReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }
    println!("Deployed {} mod(s) using {}", report.mod_count, report.method);
    println!(
        "  files: {}  added: {}  removed: {}  relinked: {}",
        report.file_count,
        report.added,
        report.removed,
        report.source_changed + report.content_changed
    );
    for archive in &report.merged {
        println!("  merged: {archive}");
    }
    for cycle in &report.cycles {
        println!("  cycle (order left unsorted): {}", cycle.join(" -> "));
    }
    for failure in &report.failures {
        println!("  failed: {} ({})", failure.rel_path, failure.error);
    }
    if let Some(notification) = &report.notification {
        println!("{notification}");
    }
    Ok(())
}

fn print_purge_report(report: &PurgeReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }
    println!(
        "Purged {} file(s), restored {} backup(s), removed {} folder(s)",
        report.removed, report.restored, report.directories_removed
    );
    if report.failed > 0 {
        println!("{} file(s) could not be removed", report.failed);
    }
    Ok(())
}

fn print_changes(changes: &[ExternalChange], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&changes);
    }
    if changes.is_empty() {
        println!("No external changes");
        return Ok(());
    }
    for change in changes {
        let label = match change.change {
            crate::linking::ChangeType::RefChange => "replaced",
            crate::linking::ChangeType::Deleted => "deleted",
            crate::linking::ChangeType::SrcDeleted => "source deleted",
        };
        println!("{label:<15} {}  ({})", change.rel_path, change.source);
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_help() {
    println!("modstage v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modstage deploy [--reset]       Deploy enabled mods into the game folder");
    println!("  modstage purge                  Remove all deployed files");
    println!("  modstage order                  Show the resolved load order");
    println!("  modstage check                  Report deployed files changed externally");
    println!("  modstage methods                List deployment methods and availability");
    println!();
    println!("Global options:");
    println!("  --format <json|text>            Output format");
    println!("  -v, --verbose                   Log to stderr as well");
    println!("  -h, --help                      Show help");
    println!("  -V, --version                   Show version");
}
