// SPDX-License-Identifier: GPL-2.0-only
use clap::{Parser, Subcommand, ValueEnum};
use kvmcli_lib::backend::qemu_img::QemuImgBackend;
use kvmcli_lib::config::{self, Config};
use kvmcli_lib::hypervisor::traits::Hypervisor;
use kvmcli_lib::hypervisor::virsh::VirshHypervisor;
use kvmcli_lib::manifest;
use kvmcli_lib::operator::{ApplyReport, Operator, Settings};
use kvmcli_lib::resource::{Kind, Resource};
use kvmcli_lib::state::sqlite::SqliteStore;
use kvmcli_lib::record::VmRecord;
use kvmcli_lib::state::traits::{NetworkTable, StateStore, StoreError, StoreTable, VmTable};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

mod logging;

const EXIT_GENERAL_ERROR: u8 = 1;
const EXIT_MANIFEST: u8 = 2;
const EXIT_DATABASE: u8 = 3;
const EXIT_HYPERVISOR: u8 = 4;

#[derive(Parser)]
#[command(
    name = "kvmcli",
    about = "Declarative KVM infrastructure from YAML manifests",
    version
)]
struct Cli {
    /// Path to configuration file
    /// [default: $XDG_CONFIG_HOME/kvmcli/kvmcli.yaml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to database file
    /// [default: $XDG_STATE_HOME/kvmcli/kvmcli.db]
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// libvirt connection URI [default: qemu:///system]
    #[arg(long, global = true)]
    connect: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every resource in a manifest
    Create {
        /// Manifest file (one or more YAML documents)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Delete every resource in a manifest, VMs first
    Delete {
        /// Manifest file (one or more YAML documents)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// List resources known to the database
    Get {
        #[arg(value_enum)]
        target: Target,
        /// Only this namespace [default: all]
        #[arg(short, long)]
        namespace: Option<String>,
        #[arg(short, long, value_enum, default_value = "table")]
        output: Output,
    },
    /// Power on a defined VM
    Start {
        #[command(subcommand)]
        target: PowerTarget,
    },
    /// Power off a running VM
    Stop {
        #[command(subcommand)]
        target: PowerTarget,
        /// Pull the plug instead of asking the guest to shut down
        #[arg(long, global = true)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PowerTarget {
    Vm {
        name: String,
        /// Namespace of the VM [default: the only VM with that name]
        #[arg(short, long)]
        namespace: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    #[value(alias = "vms")]
    Vm,
    #[value(alias = "networks")]
    Network,
    #[value(alias = "stores")]
    Store,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    Table,
    Yaml,
}

#[derive(Clone, Copy)]
enum Action {
    Create,
    Delete,
}

#[derive(Clone, Copy)]
enum Power {
    Start,
    Stop { force: bool },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let config = match Config::load(&config_path) {
        Ok(config) => {
            info!(config_path = %config_path.display(), "loaded configuration");
            config
        }
        Err(e) if e.is_not_found() => Config::default(),
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "invalid configuration file");
            return ExitCode::from(EXIT_GENERAL_ERROR);
        }
    };

    match &cli.command {
        Commands::Create { file } => cmd_apply(&cli, &config, file, Action::Create),
        Commands::Delete { file } => cmd_apply(&cli, &config, file, Action::Delete),
        Commands::Get {
            target,
            namespace,
            output,
        } => cmd_get(&cli, &config, *target, namespace.as_deref(), *output),
        Commands::Start { target } => cmd_power(&cli, &config, target, Power::Start),
        Commands::Stop { target, force } => {
            cmd_power(&cli, &config, target, Power::Stop { force: *force })
        }
    }
}

fn db_path(cli: &Cli, config: &Config) -> PathBuf {
    cli.db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.database.path))
}

fn open_store(path: &Path) -> Result<SqliteStore, ExitCode> {
    let store = SqliteStore::open_and_init(path).map_err(|e| {
        error!(error = %e, db_path = %path.display(), "failed to initialize database");
        ExitCode::from(EXIT_DATABASE)
    })?;
    match store.status() {
        Ok(status) => debug!(
            path = %status.path,
            tables = status.table_count,
            size_bytes = ?status.size_bytes,
            "database ready"
        ),
        Err(e) => warn!(error = %e, "cannot read database status"),
    }
    Ok(store)
}

fn connect(cli: &Cli, config: &Config) -> Result<VirshHypervisor, String> {
    let uri = cli.connect.as_deref().unwrap_or(&config.hypervisor.uri);
    VirshHypervisor::connect(&config.hypervisor.virsh, uri).map_err(|e| e.to_string())
}

fn overlays(config: &Config) -> QemuImgBackend {
    QemuImgBackend::new(config.overlay.qemu_img.clone(), config.overlay.timeout())
}

fn settings(config: &Config) -> Settings {
    Settings {
        mac_prefix: config.network.mac_prefix.clone(),
    }
}

/// Release the hypervisor and the database. Failures only warn.
fn shutdown(store: &SqliteStore, hv: Option<&VirshHypervisor>) {
    if let Some(hv) = hv {
        if let Err(e) = hv.disconnect() {
            warn!(error = %e, "failed to disconnect from hypervisor");
        }
    }
    if let Err(e) = store.close() {
        warn!(error = %e, "failed to close database");
    }
}

fn cmd_apply(cli: &Cli, config: &Config, file: &Path, action: Action) -> ExitCode {
    let resources = match manifest::load(file) {
        Ok(resources) => resources,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_MANIFEST);
        }
    };
    if resources.is_empty() {
        println!("No resources in {}.", file.display());
        return ExitCode::SUCCESS;
    }
    info!(manifest = %file.display(), count = resources.len(), "manifest loaded");

    let store = match open_store(&db_path(cli, config)) {
        Ok(store) => store,
        Err(code) => return code,
    };

    // Stores are pure bookkeeping; only networks and VMs need libvirt.
    let needs_hypervisor = resources.iter().any(|r| r.kind() != Kind::Store);
    let hv = if needs_hypervisor {
        match connect(cli, config) {
            Ok(hv) => Some(hv),
            Err(e) => {
                error!(error = %e, "failed to connect to hypervisor");
                shutdown(&store, None);
                return ExitCode::from(EXIT_HYPERVISOR);
            }
        }
    } else {
        None
    };

    let backend = overlays(config);
    let settings = settings(config);
    let operator = Operator::new(
        &store,
        hv.as_ref().map(|h| h as &dyn Hypervisor),
        &backend,
        &settings,
    );
    let report = match action {
        Action::Create => operator.create_all(&resources),
        Action::Delete => operator.delete_all(&resources),
    };
    print_report(&report, action);

    shutdown(&store, hv.as_ref());
    ExitCode::SUCCESS
}

fn print_report(report: &ApplyReport, action: Action) {
    let verb = match action {
        Action::Create => "created",
        Action::Delete => "deleted",
    };
    for r in &report.applied {
        println!("{r} {verb}");
    }
    for (r, e) in &report.failed {
        eprintln!("{r} failed: {e}");
    }
}

fn cmd_power(cli: &Cli, config: &Config, target: &PowerTarget, power: Power) -> ExitCode {
    let PowerTarget::Vm { name, namespace } = target;

    let store = match open_store(&db_path(cli, config)) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let hv = match connect(cli, config) {
        Ok(hv) => hv,
        Err(e) => {
            error!(error = %e, "failed to connect to hypervisor");
            shutdown(&store, None);
            return ExitCode::from(EXIT_HYPERVISOR);
        }
    };

    let backend = overlays(config);
    let settings = settings(config);
    let operator = Operator::new(&store, Some(&hv as &dyn Hypervisor), &backend, &settings);
    let vms = operator.vms();
    let ns = namespace.as_deref();
    let result = match power {
        Power::Start => vms.start(name, ns).map(|changed| {
            if changed {
                format!("vm/{name} started")
            } else {
                format!("vm/{name} is already running")
            }
        }),
        Power::Stop { force } => vms.stop(name, ns, force).map(|changed| {
            if changed {
                format!("vm/{name} stopped")
            } else {
                format!("vm/{name} is not running")
            }
        }),
    };

    let code = match result {
        Ok(message) => {
            println!("{message}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_GENERAL_ERROR)
        }
    };
    shutdown(&store, Some(&hv));
    code
}

fn cmd_get(
    cli: &Cli,
    config: &Config,
    target: Target,
    namespace: Option<&str>,
    output: Output,
) -> ExitCode {
    let store = match open_store(&db_path(cli, config)) {
        Ok(store) => store,
        Err(code) => return code,
    };

    let result = match target {
        Target::Store => get_stores(&store, namespace, output),
        Target::Network => get_networks(&store, namespace, output),
        Target::Vm => get_vms(cli, config, &store, namespace, output),
    };

    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_DATABASE)
        }
    };
    if let Err(e) = store.close() {
        warn!(error = %e, "failed to close database");
    }
    code
}

fn print_yaml(resources: Vec<Resource>) {
    let docs: Vec<String> = resources
        .iter()
        .filter_map(|r| match serde_norway::to_string(r) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(resource = %r.reference(), error = %e, "cannot render resource");
                None
            }
        })
        .collect();
    if !docs.is_empty() {
        print!("{}", docs.join("---\n"));
    }
}

fn get_stores(
    store: &dyn StateStore,
    namespace: Option<&str>,
    output: Output,
) -> Result<(), StoreError> {
    let stores = store.list_stores(namespace)?;
    if output == Output::Yaml {
        print_yaml(stores.iter().map(|s| Resource::Store(s.to_resource())).collect());
        return Ok(());
    }
    if stores.is_empty() {
        println!("No stores found.");
        return Ok(());
    }
    println!(
        "{:<20} {:<12} {:<8} {:<8} {:<40} {:<6}",
        "NAME", "NAMESPACE", "BACKEND", "IMAGES", "ARTIFACTS", "AGE"
    );
    for s in &stores {
        println!(
            "{:<20} {:<12} {:<8} {:<8} {:<40} {:<6}",
            s.name,
            s.namespace,
            s.backend,
            s.images.len(),
            s.artifacts_path.to_string_lossy(),
            format_age(s.created_at),
        );
    }
    Ok(())
}

fn get_networks(
    store: &dyn StateStore,
    namespace: Option<&str>,
    output: Output,
) -> Result<(), StoreError> {
    let networks = store.list_networks(namespace)?;
    if output == Output::Yaml {
        print_yaml(networks.iter().map(|n| Resource::Network(n.to_resource())).collect());
        return Ok(());
    }
    if networks.is_empty() {
        println!("No networks found.");
        return Ok(());
    }
    println!(
        "{:<20} {:<12} {:<10} {:<18} {:<32} {:<6}",
        "NAME", "NAMESPACE", "MODE", "SUBNET", "DHCP", "AGE"
    );
    for n in &networks {
        let subnet = n.to_resource().subnet().map(|s| s.to_string()).unwrap_or_default();
        let dhcp = n
            .dhcp
            .map(|d| format!("{}-{}", d.start, d.end))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<12} {:<10} {:<18} {:<32} {:<6}",
            n.name,
            n.namespace,
            n.mode.as_str(),
            subnet,
            dhcp,
            format_age(n.created_at),
        );
    }
    Ok(())
}

fn get_vms(
    cli: &Cli,
    config: &Config,
    store: &dyn StateStore,
    namespace: Option<&str>,
    output: Output,
) -> Result<(), StoreError> {
    let vms = store.list_vms(namespace)?;

    if output == Output::Yaml {
        let mut docs = Vec::with_capacity(vms.len());
        for vm in &vms {
            let (network, store_name) = owner_names(store, vm)?;
            docs.push(Resource::VirtualMachine(vm.to_resource(&network, &store_name)));
        }
        print_yaml(docs);
        return Ok(());
    }
    if vms.is_empty() {
        println!("No VMs found.");
        return Ok(());
    }

    // Live state is a nicety: without libvirt the table still prints.
    let hv = match connect(cli, config) {
        Ok(hv) => Some(hv),
        Err(e) => {
            warn!(error = %e, "hypervisor unavailable, state unknown");
            None
        }
    };
    let backend = overlays(config);
    let settings = settings(config);
    let operator = Operator::new(
        store,
        hv.as_ref().map(|h| h as &dyn Hypervisor),
        &backend,
        &settings,
    );

    println!(
        "{:<20} {:<12} {:<10} {:<5} {:<8} {:<10} {:<16} {:<12} {:<16} {:<6}",
        "NAME", "NAMESPACE", "STATE", "CPU", "MEMORY", "DISK", "IP", "NETWORK", "OS", "AGE"
    );
    for vm in &vms {
        let live = operator.vms().info(&vm.name);
        let state = live
            .as_ref()
            .map(|i| i.state.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let disk = match live.as_ref().and_then(|i| i.disk_bytes) {
            Some(bytes) => format_gb(bytes),
            None => vm.disk_size.clone().unwrap_or_else(|| "-".to_string()),
        };
        let ip = vm
            .ip_address
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        let (network, _) = owner_names(store, vm)?;
        let os = match store.find_image(vm.store_id, &vm.image)? {
            Some(image) if !image.version.is_empty() => format!("{} {}", image.name, image.version),
            _ => vm.image.clone(),
        };
        println!(
            "{:<20} {:<12} {:<10} {:<5} {:<8} {:<10} {:<16} {:<12} {:<16} {:<6}",
            vm.name,
            vm.namespace,
            state,
            vm.cpu,
            format!("{}M", vm.ram),
            disk,
            ip,
            network,
            os,
            format_age(vm.created_at),
        );
    }

    if let Some(hv) = &hv {
        if let Err(e) = hv.disconnect() {
            warn!(error = %e, "failed to disconnect from hypervisor");
        }
    }
    Ok(())
}

/// Names of the network and store a VM row points at, or their ids when the
/// rows are gone.
fn owner_names(store: &dyn StateStore, vm: &VmRecord) -> Result<(String, String), StoreError> {
    let network = store
        .get_network_by_id(vm.network_id)?
        .map(|n| n.name)
        .unwrap_or_else(|| vm.network_id.to_string());
    let store_name = store
        .get_store_by_id(vm.store_id)?
        .map(|s| s.name)
        .unwrap_or_else(|| vm.store_id.to_string());
    Ok((network, store_name))
}

fn format_gb(bytes: u64) -> String {
    format!("{:.2}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

/// Compact age like `3d`, `5h`, `12m` or `40s`.
fn format_age(created_at: i64) -> String {
    let secs = (chrono::Utc::now().timestamp() - created_at).max(0);
    match secs {
        s if s >= 86_400 => format!("{}d", s / 86_400),
        s if s >= 3_600 => format!("{}h", s / 3_600),
        s if s >= 60 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_units() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_age(now + 100), "0s");
        assert_eq!(format_age(now - 90), "1m");
        assert_eq!(format_age(now - 2 * 3_600 - 5), "2h");
        assert_eq!(format_age(now - 3 * 86_400), "3d");
    }

    #[test]
    fn disk_sizes_in_gigabytes() {
        assert_eq!(format_gb(20 * 1024 * 1024 * 1024), "20.00G");
        assert_eq!(format_gb(1536 * 1024 * 1024), "1.50G");
    }

    #[test]
    fn cli_parses_power_commands() {
        let cli = Cli::try_parse_from(["kvmcli", "start", "vm", "vm-01"]).unwrap();
        match cli.command {
            Commands::Start {
                target: PowerTarget::Vm { name, namespace },
            } => {
                assert_eq!(name, "vm-01");
                assert_eq!(namespace, None);
            }
            _ => panic!("unexpected command"),
        }

        let cli = Cli::try_parse_from(["kvmcli", "stop", "vm", "vm-01", "-n", "dev", "--force"]).unwrap();
        match cli.command {
            Commands::Stop {
                target: PowerTarget::Vm { name, namespace },
                force,
            } => {
                assert_eq!(name, "vm-01");
                assert_eq!(namespace.as_deref(), Some("dev"));
                assert!(force);
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn cli_parses_get_with_flags() {
        let cli = Cli::try_parse_from(["kvmcli", "--db", "/tmp/x.db", "get", "vms", "-n", "dev", "-o", "yaml"])
            .unwrap();
        match cli.command {
            Commands::Get {
                target: Target::Vm,
                namespace,
                output: Output::Yaml,
            } => assert_eq!(namespace.as_deref(), Some("dev")),
            _ => panic!("unexpected command"),
        }
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
    }
}
