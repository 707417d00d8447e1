#![deny(unused_imports)]

use std::path::PathBuf;

use anyhow::anyhow;
use aya::EbpfLoader;
use clap::builder::styling;
use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use env_logger::Builder;
use kpath::config::Config;
use kpath::resolver::PathnamesResolver;
use kpath::store::PinnedMaps;
use kpath::util::is_root;
use log::{info, LevelFilter};

const ABOUT_KPATH: &str = r#"
Resolves kernel dentries (mount id + inode) into paths and manages
the kprobes feeding the pathnames table.
"#;

#[derive(Debug, Parser)]
#[command(author, version, about = ABOUT_KPATH, long_about = None)]
struct Cli {
    /// Enable debugging
    #[arg(short, long)]
    debug: bool,

    /// Silents out logging
    #[arg(short, long)]
    silent: bool,

    /// Set verbosity level, repeat option for more verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConfigOpt {
    /// Dump a default configuration
    #[arg(long)]
    dump: bool,

    /// Validate a configuration file
    #[arg(long, value_name = "FILE")]
    check: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum ProbesAction {
    /// Register every kprobe found in configuration
    Register,
    /// Unregister every kprobe found in configuration
    Unregister,
}

#[derive(Debug, Args)]
struct ProbesOpt {
    /// Specify a configuration file to use
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    action: ProbesAction,
}

#[derive(Debug, Args)]
struct ResolveOpt {
    /// Specify a configuration file to use
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Load the table from an eBPF object instead of pinned maps.
    /// The object must pin the table by name (LIBBPF_PIN_BY_NAME)
    /// under --pin-dir, otherwise a new and empty table is created.
    #[arg(long, value_name = "FILE")]
    object: Option<PathBuf>,

    /// Directory where the table is pinned
    #[arg(long, value_name = "DIR", default_value = "/sys/fs/bpf")]
    pin_dir: PathBuf,

    /// Mount id of the dentry
    #[arg(short, long)]
    mount_id: u32,

    /// Inode of the dentry
    #[arg(short, long)]
    inode: u64,

    /// Only print the name of the dentry
    #[arg(long)]
    name_only: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dump or check configuration
    Config(ConfigOpt),
    /// Register or unregister kprobes
    Probes(ProbesOpt),
    /// Resolve the path of a dentry
    Resolve(ResolveOpt),
}

impl Command {
    fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
        match path {
            Some(p) => Config::from_file(&p)
                .map_err(|e| anyhow!("failed to read config {}: {e}", p.to_string_lossy())),
            None => Ok(Config::default()),
        }
    }

    fn config(o: ConfigOpt) -> anyhow::Result<()> {
        if o.dump {
            println!("{}", serde_yaml::to_string(&Config::default())?);
            return Ok(());
        }

        if let Some(p) = o.check {
            Self::load_config(Some(p))?;
            println!("configuration is valid");
        }

        Ok(())
    }

    fn probes(o: ProbesOpt) -> anyhow::Result<()> {
        if !is_root() {
            return Err(anyhow!(
                "You need to be root to run this program, this is necessary to manage kprobes"
            ));
        }

        let conf = Self::load_config(o.config)?;
        let manager = conf.kprobe_manager();

        match o.action {
            ProbesAction::Register => manager.register_all(&conf.kprobes)?,
            ProbesAction::Unregister => manager.unregister_all(&conf.kprobes)?,
        }

        info!("{} kprobe(s) processed", conf.kprobes.len());
        Ok(())
    }

    fn resolve(o: ResolveOpt) -> anyhow::Result<()> {
        if !is_root() {
            return Err(anyhow!(
                "You need to be root to run this program, this is necessary to read eBPF maps"
            ));
        }

        let conf = Self::load_config(o.config)?;
        let mut resolver: PathnamesResolver = conf.resolver();

        match o.object {
            Some(object) => {
                info!("loading eBPF object {}", object.to_string_lossy());
                // maps pinned by name are reused from pin_dir
                let mut bpf = EbpfLoader::new()
                    .map_pin_path(&o.pin_dir)
                    .load_file(&object)?;
                resolver.start(&mut bpf)?;
            }
            None => resolver.start(&mut PinnedMaps::new(&o.pin_dir))?,
        }

        if o.name_only {
            println!("{}", resolver.try_get_name(o.mount_id, o.inode)?);
        } else {
            println!("{}", resolver.resolve(o.mount_id, o.inode));
        }

        Ok(())
    }
}

fn main() -> Result<(), anyhow::Error> {
    let c = {
        let c: clap::Command = Cli::command();
        let styles = styling::Styles::styled()
            .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .literal(styling::AnsiColor::Blue.on_default() | styling::Effects::BOLD)
            .placeholder(styling::AnsiColor::Cyan.on_default());

        c.styles(styles).help_template(
            r#"{about-with-newline}
{author-with-newline}
{usage-heading} {usage}

{all-args}"#,
        )
    };

    let cli: Cli = Cli::from_arg_matches(&c.get_matches())?;

    // setting log level according to the verbosity level
    let mut log_level = LevelFilter::Warn;
    match cli.verbose {
        1 => log_level = LevelFilter::Info,
        2 => log_level = LevelFilter::Debug,
        3..=u8::MAX => log_level = LevelFilter::Trace,
        _ => {}
    }

    if cli.debug {
        log_level = LevelFilter::Debug;
    }

    // silent out logging if specified in CLI
    if cli.silent {
        log_level = LevelFilter::Off;
    }

    // building the logger
    Builder::new().filter_level(log_level).init();

    match cli.command {
        Command::Config(o) => Command::config(o),
        Command::Probes(o) => Command::probes(o),
        Command::Resolve(o) => Command::resolve(o),
    }
}
