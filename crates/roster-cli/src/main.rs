//! `roster-sync` command line
//!
//! Runs reconciliation passes against an in-memory organization seeded from a
//! JSON snapshot and reports what each pass changed.

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use roster_core::{
    BranchId, BranchReport, EmployeePsId, InMemoryBackend, MemberReport, Reconciler, Snapshot,
    SyncConfig,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    Command::new("roster-sync")
        .version(roster_core::VERSION)
        .about("Reconcile branch rosters into chat-vendor groups")
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output format"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run reconciliation passes against a snapshot")
                .arg(
                    Arg::new("snapshot")
                        .long("snapshot")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON snapshot seeding directory, vendor and mirror"),
                )
                .arg(
                    Arg::new("branch")
                        .long("branch")
                        .action(ArgAction::Append)
                        .help("Branch to reconcile (default: every branch)"),
                )
                .arg(
                    Arg::new("member")
                        .long("member")
                        .action(ArgAction::Append)
                        .help("Member to reconcile after the branches"),
                )
                .arg(
                    Arg::new("passes")
                        .long("passes")
                        .default_value("2")
                        .value_parser(value_parser!(u32).range(1..))
                        .help("Number of passes"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML configuration file"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the final state as a snapshot"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print pass reports as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the resolved configuration")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML configuration file"),
                ),
        )
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    Snapshot::from_json_str(&text).with_context(|| format!("parsing snapshot {}", path.display()))
}

#[derive(Debug, Clone)]
struct SimulateArgs {
    snapshot: PathBuf,
    branches: Vec<BranchId>,
    members: Vec<EmployeePsId>,
    passes: u32,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
}

impl SimulateArgs {
    fn from_matches(args: &ArgMatches) -> Result<Self> {
        let snapshot = args
            .get_one::<PathBuf>("snapshot")
            .cloned()
            .context("--snapshot is required")?;
        Ok(Self {
            snapshot,
            branches: args
                .get_many::<String>("branch")
                .unwrap_or_default()
                .map(|b| BranchId::from(b.as_str()))
                .collect(),
            members: args
                .get_many::<String>("member")
                .unwrap_or_default()
                .map(|m| EmployeePsId::from(m.as_str()))
                .collect(),
            passes: args.get_one::<u32>("passes").copied().unwrap_or(2),
            config: args.get_one::<PathBuf>("config").cloned(),
            output: args.get_one::<PathBuf>("output").cloned(),
            json: args.get_flag("json"),
        })
    }
}

/// What one simulated pass did
#[derive(Debug, Serialize)]
struct PassSummary {
    pass: u32,
    vendor_mutations: usize,
    branches: Vec<BranchReport>,
    members: Vec<MemberReport>,
    errors: Vec<String>,
}

impl PassSummary {
    fn converged(&self) -> bool {
        self.vendor_mutations == 0
            && self.errors.is_empty()
            && self.branches.iter().all(BranchReport::is_noop)
    }

    fn print_text(&self) {
        println!("Pass {}:", self.pass);
        for report in &self.branches {
            println!(
                "  branch {}: {} vendor changes, {} mirror changes, {} failures",
                report.branch_id,
                report.vendor_changes(),
                report.mirror_changes(),
                report.failures
            );
            println!(
                "    identities: {} created, {} relinked, {} orphans deleted, {} unresolved, {} retained",
                report.identities_created,
                report.identities_relinked,
                report.orphans_deleted,
                report.unresolved_members,
                report.retained_members
            );
            println!(
                "    groups: {} created, {} deleted, {} archived, {} unarchived, {} renamed",
                report.groups_created,
                report.groups_deleted,
                report.groups_archived,
                report.groups_unarchived,
                report.groups_renamed
            );
        }
        for report in &self.members {
            println!(
                "  member {}: drift={}, {} archived, {} left, {} branch passes",
                report.employee_ps_id,
                report.drift_detected,
                report.groups_archived,
                report.groups_left,
                report.branch_reports.len()
            );
        }
        for error in &self.errors {
            println!("  error: {error}");
        }
        println!("  vendor mutations: {}", self.vendor_mutations);
    }
}

async fn run_pass(
    pass: u32,
    reconciler: &Reconciler,
    backend: &InMemoryBackend,
    branches: &[BranchId],
    members: &[EmployeePsId],
) -> PassSummary {
    backend.vendor.clear_mutations();
    let mut summary = PassSummary {
        pass,
        vendor_mutations: 0,
        branches: Vec::new(),
        members: Vec::new(),
        errors: Vec::new(),
    };
    for branch_id in branches {
        match reconciler.reconcile_branch(branch_id).await {
            Ok(report) => summary.branches.push(report),
            Err(err) => summary.errors.push(format!("branch {branch_id}: {err}")),
        }
    }
    for employee_ps_id in members {
        match reconciler.reconcile_member(employee_ps_id).await {
            Ok(report) => summary.members.push(report),
            Err(err) => summary.errors.push(format!("member {employee_ps_id}: {err}")),
        }
    }
    summary.vendor_mutations = backend.vendor.mutation_count();
    summary
}

/// Run every pass; returns the summaries and the final backend state
async fn simulate(args: &SimulateArgs) -> Result<(Vec<PassSummary>, InMemoryBackend)> {
    let config = load_config(args.config.as_ref())?;
    let snapshot = load_snapshot(&args.snapshot)?;
    let backend = InMemoryBackend::from_snapshot(snapshot);
    let reconciler = Reconciler::new(
        config,
        backend.vendor.clone(),
        backend.directory.clone(),
        backend.mirror.clone(),
    );

    let branches = if args.branches.is_empty() {
        backend
            .directory
            .branches()
            .into_iter()
            .map(|b| b.branch_id)
            .collect()
    } else {
        args.branches.clone()
    };

    let mut summaries = Vec::new();
    for pass in 1..=args.passes {
        let summary = run_pass(pass, &reconciler, &backend, &branches, &args.members).await;
        tracing::info!(pass, converged = summary.converged(), "pass finished");
        summaries.push(summary);
    }
    Ok((summaries, backend))
}

async fn run_simulate(args: &ArgMatches) -> Result<bool> {
    let args = SimulateArgs::from_matches(args)?;
    let (summaries, backend) = simulate(&args).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for summary in &summaries {
            summary.print_text();
        }
    }

    if let Some(path) = &args.output {
        let text = serde_json::to_string_pretty(&backend.to_snapshot())?;
        std::fs::write(path, text)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
    }

    let converged = summaries.last().is_some_and(PassSummary::converged);
    if !converged {
        eprintln!("final pass still changed state; not converged");
    }
    Ok(converged)
}

fn run_config(args: &ArgMatches) -> Result<()> {
    let config = load_config(args.get_one::<PathBuf>("config"))?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let log_format = matches
        .get_one::<String>("log-format")
        .map_or("text", String::as_str);
    init_tracing(log_format);

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let converged = run_simulate(args).await?;
            std::process::exit(if converged { 0 } else { 1 });
        }
        Some(("config", args)) => run_config(args),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::{Branch, OrgMember, VendorIdentity};
    use std::io::Write;

    fn member(id: &str, level: u32) -> OrgMember {
        OrgMember {
            employee_ps_id: id.into(),
            first_name: "Jo".to_string(),
            last_name: id.to_string(),
            email: format!("{}@example.com", id.to_lowercase()),
            selected_branch_ids: vec!["104".into()],
            override_branch_ids: None,
            job_id: "RN".into(),
            job_level: level,
            status: roster_core::ActiveStatus::Active,
            vendor_identity: VendorIdentity::Absent,
        }
    }

    fn snapshot_file() -> tempfile::NamedTempFile {
        let mut snapshot = Snapshot {
            branches: vec![Branch::new("104", "Dallas")],
            members: vec![member("F1", 1), member("A1", 2)],
            ..Snapshot::default()
        };
        snapshot.job_categories.insert(
            "RN".into(),
            vec![roster_core::JobCategory::Clinical],
        );
        snapshot.vendor.system_user = Some("root".into());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&snapshot).unwrap().as_bytes())
            .unwrap();
        file
    }

    fn simulate_args(snapshot: &Path) -> SimulateArgs {
        let matches = cli()
            .try_get_matches_from([
                "roster-sync",
                "simulate",
                "--snapshot",
                snapshot.to_str().unwrap(),
                "--member",
                "F1",
            ])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        SimulateArgs::from_matches(args).unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn test_rejects_zero_passes() {
        let result = cli().try_get_matches_from([
            "roster-sync",
            "simulate",
            "--snapshot",
            "s.json",
            "--passes",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parses_repeated_branches() {
        let matches = cli()
            .try_get_matches_from([
                "roster-sync",
                "--log-format",
                "json",
                "simulate",
                "--snapshot",
                "s.json",
                "--branch",
                "104",
                "--branch",
                "105",
                "--json",
            ])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        let args = SimulateArgs::from_matches(args).unwrap();
        assert_eq!(args.branches, vec![BranchId::from("104"), BranchId::from("105")]);
        assert_eq!(args.passes, 2);
        assert!(args.json);
    }

    #[tokio::test]
    async fn test_simulation_converges_on_second_pass() {
        let file = snapshot_file();
        let args = simulate_args(file.path());

        let (summaries, backend) = simulate(&args).await.unwrap();

        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].converged());
        assert!(summaries[0].errors.is_empty());
        assert!(summaries[1].converged(), "{:?}", summaries[1]);
        assert_eq!(backend.vendor.users().len(), 2);
        assert!(!backend.mirror.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_chunk_size = 4\nroot_vendor_id = \"svc\"").unwrap();

        let config = load_config(Some(&file.path().to_path_buf())).unwrap();

        assert_eq!(config.batch_chunk_size, 4);
        assert_eq!(config.root_vendor_id.as_str(), "svc");
        assert_eq!(config.group_page_size, SyncConfig::default().group_page_size);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_chunk_size = 0").unwrap();

        assert!(load_config(Some(&file.path().to_path_buf())).is_err());
    }
}
