//! deskbridge - session indicator service and Bluetooth agents/tools.
//!
//! Without a subcommand this runs the daemon: the session indicator, the
//! BlueZ pairing agent and the OBEX push receiver, each as enabled in
//! `[services]`. The subcommands are one-shot Bluetooth tools.

mod sendto;
mod services;

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use deskbridge_core::bluetooth::types;
use deskbridge_core::{Config, ConfigLoadResult, logging};
use gtk4::glib;
use tracing::{debug, info, warn};

use crate::services::bluetooth::{BluetoothClient, Done};
use crate::services::bluetooth_agent::BluetoothAgent;
use crate::services::config_manager::ConfigManager;
use crate::services::indicator::IndicatorService;
use crate::services::obex_agent::ObexAgent;
use crate::services::prompt::TerminalPresenter;
use crate::services::session::actions::DbusActions;
use crate::services::session::guest::DbusGuest;
use crate::services::session::users::DbusUsers;
use crate::services::session::SessionEnv;

/// How long CLI commands wait for the first BlueZ object list.
const BLUEZ_READY_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_SCAN_SECS: u64 = 10;

/// deskbridge - session indicator and Bluetooth tools
#[derive(Parser, Debug)]
#[command(name = "deskbridge", version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (uses XDG lookup if not specified)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print example configuration and exit
    #[arg(long)]
    print_example_config: bool,

    /// Validate configuration and exit (returns non-zero on errors)
    #[arg(long)]
    check_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run only the session indicator
    Indicator,
    /// List adapters and devices
    Devices {
        /// Print JSON instead of the text dump
        #[arg(long)]
        json: bool,
    },
    /// Control the default adapter
    Adapter {
        #[command(subcommand)]
        action: AdapterAction,
    },
    /// Pair with a device (answers agent prompts on this terminal)
    Pair { address: String },
    /// Mark a device as trusted
    Trust {
        address: String,
        /// Remove the trusted mark instead
        #[arg(long)]
        off: bool,
    },
    /// Connect all profiles of a device
    Connect { address: String },
    /// Disconnect a device
    Disconnect { address: String },
    /// Remove a device and its pairing
    Forget { address: String },
    /// Send files over OBEX Object Push
    Send {
        /// Target device address (asks when omitted)
        #[arg(long, alias = "dest")]
        device: Option<String>,
        /// Name to show for the device
        #[arg(long)]
        name: Option<String>,
        /// Files to send (read from stdin when omitted)
        files: Vec<PathBuf>,
    },
    /// Start `send` for a device in a new process
    SendTo {
        address: String,
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AdapterAction {
    /// Show the default adapter
    Status,
    /// Turn the adapter on or off
    Power { state: Switch },
    /// Make the adapter visible to other devices
    Discoverable { state: Switch },
    /// Discover nearby devices for a while and list them
    Scan {
        /// Seconds to scan (default: 10)
        secs: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        self == Switch::On
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    logging::init(args.verbose);

    // --print-example-config needs no config file at all
    if args.print_example_config {
        print!("{}", deskbridge_core::config::DEFAULT_CONFIG_TOML);
        return ExitCode::SUCCESS;
    }

    // If --config is specified, it must exist and be valid (no fallback)
    let load_result = match load_config(args.config.as_deref()) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.check_config {
        for warning in load_result.config.warnings() {
            eprintln!("Warning: {}", warning);
        }
        if let Some(ref source) = load_result.source {
            println!("Configuration valid: {}", source.display());
        } else {
            println!("Configuration valid (using defaults)");
        }
        return ExitCode::SUCCESS;
    }

    let result = match args.command {
        None => run_daemon(load_result, true),
        Some(command) => handle_command(command, load_result),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<ConfigLoadResult> {
    let load_result = Config::find_and_load(explicit)?;

    if let Some(ref source) = load_result.source {
        info!("Loaded configuration from {:?}", source);
    } else if load_result.used_defaults {
        warn!("Using default configuration (no config file found)");
    }

    load_result.config.validate()?;
    debug!("Configuration validated successfully");
    Ok(load_result)
}

// Daemon

/// Run the enabled services until SIGINT/SIGTERM or until the indicator
/// loses its bus name. `agents` is false for `deskbridge indicator`.
fn run_daemon(load_result: ConfigLoadResult, agents: bool) -> Result<()> {
    let config = load_result.config;
    info!("{}", config.summary());

    let manager = ConfigManager::init_global(config.clone(), load_result.source);
    let main_loop = glib::MainLoop::new(None, false);

    let run_indicator = config.services.indicator || !agents;
    let run_pairing = agents && config.services.pairing_agent;
    let run_obex = agents && config.services.obex_agent;
    if !(run_indicator || run_pairing || run_obex) {
        bail!("all services are disabled in [services]");
    }

    if run_indicator {
        let env = SessionEnv::from_env();
        debug!("Session environment: {:?}", env);
        let actions = DbusActions::new(env.clone(), &config.session, &config.lockdown);
        let users = DbusUsers::new(env.clone());
        let guest = DbusGuest::new(env);
        let indicator = IndicatorService::new(config.clone(), actions, users, guest);

        let main_loop_for_lost = main_loop.clone();
        indicator.connect_name_lost(move || {
            warn!("Lost {}, exiting", services::indicator::BUS_NAME);
            main_loop_for_lost.quit();
        });
        indicator.start();
        manager.set_indicator(indicator);
    }

    if run_pairing {
        BluetoothAgent::init_global(TerminalPresenter::global(), &config.bluetooth);
    }
    if run_obex {
        ObexAgent::init_global(config.obex.clone());
    }

    for signal in [libc::SIGINT, libc::SIGTERM] {
        let main_loop = main_loop.clone();
        glib::unix_signal_add_local(signal, move || {
            info!("Received signal {}, shutting down", signal);
            main_loop.quit();
            glib::ControlFlow::Break
        });
    }

    manager.start_watching();
    info!("deskbridge running");
    main_loop.run();

    manager.stop_watching();
    if let Some(agent) = BluetoothAgent::global() {
        agent.shutdown();
    }
    if let Some(agent) = ObexAgent::global() {
        agent.shutdown();
    }
    // Let queued unregister calls go out before exiting.
    let context = glib::MainContext::default();
    while context.iteration(false) {}

    info!("deskbridge stopped");
    Ok(())
}

// One-shot commands

fn handle_command(command: Command, load_result: ConfigLoadResult) -> Result<()> {
    match command {
        Command::Indicator => run_daemon(load_result, false),
        Command::Devices { json } => {
            let client = ready_client(false)?;
            let tree = client.tree();
            if json {
                let rows = serde_json::to_string_pretty(&tree.rows())
                    .context("failed to serialize devices")?;
                println!("{}", rows);
            } else {
                print!("{}", tree.dump());
            }
            Ok(())
        }
        Command::Adapter { action } => handle_adapter_command(action),
        Command::Pair { address } => pair(&address, &load_result.config),
        Command::Trust { address, off } => {
            let (client, path) = device(&address)?;
            run_call(|done| client.set_trusted(&path, !off, done))
                .with_context(|| format!("failed to update trust for {}", address))
        }
        Command::Connect { address } => {
            let (client, path) = device(&address)?;
            run_call(|done| client.connect_service(&path, true, done))
                .with_context(|| format!("failed to connect {}", address))
        }
        Command::Disconnect { address } => {
            let (client, path) = device(&address)?;
            run_call(|done| client.connect_service(&path, false, done))
                .with_context(|| format!("failed to disconnect {}", address))
        }
        Command::Forget { address } => {
            let (client, path) = device(&address)?;
            run_call(|done| client.remove_device(&path, done))
                .with_context(|| format!("failed to remove {}", address))
        }
        Command::Send {
            device,
            name,
            files,
        } => {
            let options = sendto::SendOptions {
                device,
                name,
                files,
            };
            // Only used for picking a device and naming it.
            let client = ready_client(false)?;
            let (address, name, files) = {
                let tree = client.tree();
                sendto::prepare(&options, &tree)?
            };
            sendto::send_files(&address, &name, files)
        }
        Command::SendTo { address, name } => send_to_address(&address, name.as_deref()),
    }
}

fn handle_adapter_command(action: AdapterAction) -> Result<()> {
    let client = ready_client(true)?;
    match action {
        AdapterAction::Status => {
            let yes_no = |b: bool| if b { "yes" } else { "no" };
            println!(
                "Adapter: {}",
                client.default_adapter_name().unwrap_or_default()
            );
            println!("Powered: {}", yes_no(client.default_adapter_powered()));
            println!("Discoverable: {}", yes_no(client.discoverable()));
            println!("Discovering: {}", yes_no(client.discovering()));
            Ok(())
        }
        AdapterAction::Power { state } => run_call(|done| client.set_powered(state.is_on(), done))
            .context("failed to change adapter power"),
        AdapterAction::Discoverable { state } => {
            run_call(|done| client.set_discoverable(state.is_on(), done))
                .context("failed to change adapter visibility")
        }
        AdapterAction::Scan { secs } => {
            let secs = secs.unwrap_or(DEFAULT_SCAN_SECS);
            if !client.discovering() {
                run_call(|done| client.set_discovering(true, done))
                    .context("failed to start discovery")?;
            }
            eprintln!("Scanning for {} seconds...", secs);

            let main_loop = glib::MainLoop::new(None, false);
            let main_loop_for_timeout = main_loop.clone();
            glib::timeout_add_local_once(Duration::from_secs(secs), move || {
                main_loop_for_timeout.quit();
            });
            main_loop.run();

            if let Err(e) = run_call(|done| client.set_discovering(false, done)) {
                warn!("Failed to stop discovery: {:#}", e);
            }
            for row in client.snapshot().devices {
                println!("{}  {}", row.address, row.display_name());
            }
            Ok(())
        }
    }
}

fn pair(address: &str, config: &Config) -> Result<()> {
    let agent = BluetoothAgent::init_global(TerminalPresenter::global(), &config.bluetooth);
    let (client, path) = device(address)?;

    agent.set_outgoing_device(Some(&path));
    let result = run_call(|done| client.create_device(&path, done));
    agent.pairing_finished();
    agent.set_outgoing_device(None);
    agent.shutdown();

    result.with_context(|| format!("failed to pair with {}", address))?;
    println!("Paired with {}", address);
    Ok(())
}

/// Re-run this binary as `send` for `address`, detached from this process.
fn send_to_address(address: &str, name: Option<&str>) -> Result<()> {
    let address = types::parse_address(address)?;
    let exe = std::env::current_exe().context("failed to locate the deskbridge binary")?;
    let child = std::process::Command::new(&exe)
        .arg("send")
        .args(types::send_to_args(Some(&address), name))
        .spawn()
        .with_context(|| format!("failed to start {}", exe.display()))?;
    debug!("Started send for {} as pid {}", address, child.id());
    Ok(())
}

/// The BlueZ client once its first object list has loaded. With
/// `need_adapter`, fails when there is no adapter to talk to.
fn ready_client(need_adapter: bool) -> Result<Rc<BluetoothClient>> {
    let client = BluetoothClient::global();
    let main_loop = glib::MainLoop::new(None, false);
    let timed_out = Rc::new(Cell::new(false));

    let main_loop_for_ready = main_loop.clone();
    let id = client.connect(move |snapshot| {
        if snapshot.is_ready {
            main_loop_for_ready.quit();
        }
    });
    if !client.snapshot().is_ready {
        let main_loop_for_timeout = main_loop.clone();
        let timed_out_flag = timed_out.clone();
        let timeout = glib::timeout_add_local_once(BLUEZ_READY_TIMEOUT, move || {
            timed_out_flag.set(true);
            main_loop_for_timeout.quit();
        });
        main_loop.run();
        if !timed_out.get() {
            timeout.remove();
        }
    }
    client.disconnect(id);

    if timed_out.get() {
        bail!("timed out waiting for BlueZ");
    }
    if need_adapter {
        if client.bluez_owner().is_none() {
            bail!("BlueZ is not running");
        }
        if client.default_adapter().is_none() {
            bail!("no Bluetooth adapter found");
        }
    }
    Ok(client)
}

/// Client plus the object path of the default adapter's device at `address`.
fn device(address: &str) -> Result<(Rc<BluetoothClient>, String)> {
    let address = types::parse_address(address)?;
    let client = ready_client(true)?;
    let path = client
        .device_path(&address)
        .ok_or_else(|| anyhow!("unknown device {}", address))?;
    Ok((client, path))
}

/// Issue one control call and block on a main loop until it completes.
fn run_call<F>(call: F) -> Result<()>
where
    F: FnOnce(Done),
{
    let main_loop = glib::MainLoop::new(None, false);
    let result: Rc<RefCell<Option<Result<(), glib::Error>>>> = Rc::new(RefCell::new(None));

    let main_loop_for_done = main_loop.clone();
    let result_for_done = result.clone();
    call(Box::new(move |res| {
        result_for_done.replace(Some(res));
        main_loop_for_done.quit();
    }));
    if result.borrow().is_none() {
        main_loop.run();
    }

    let outcome = result.borrow_mut().take();
    match outcome {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(anyhow!("{}", e.message())),
        None => bail!("call did not complete"),
    }
}
